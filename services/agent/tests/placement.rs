//! Integration tests for decentralized placement.
//!
//! Several agents (scheduler + register per node, each with its own
//! MockRuntime) share one MemoryStore, the way real nodes share one etcd
//! cluster. Manifests are written to the store and the tests wait for the
//! cluster to settle.

use std::sync::Arc;
use std::time::Duration;

use flotilla_agent::manifest::ManifestId;
use flotilla_agent::runtime::{ContainerRuntime, CreateOptions, MockRuntime};
use flotilla_agent::{Discovery, Register, Scheduler, SchedulerConfig, SlotTable};
use flotilla_coord::{Action, BackoffPolicy, KvStore, MemoryStore, Node, WatchEvent, Watcher};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const MANIFEST_KEY: &str = "/apps/shop/api/manifest";

fn manifest(scale: u32) -> String {
    format!(
        r#"{{"image":"nginx:1.18","scale":{scale},"services":{{"http":{{"port":80,"role":"web"}}}}}}"#
    )
}

fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        stagger_unit: Duration::from_millis(5),
        stop_timeout: Duration::from_secs(1),
        ..SchedulerConfig::default()
    }
}

fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        base: Duration::from_millis(5),
        max: Duration::from_millis(20),
        jitter: 0.0,
    }
}

struct TestNode {
    addr: String,
    runtime: Arc<MockRuntime>,
}

struct TestCluster {
    store: Arc<MemoryStore>,
    nodes: Vec<TestNode>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl TestCluster {
    /// Start `size` agents and give their watches time to connect.
    async fn start(size: usize) -> Self {
        let store = Arc::new(MemoryStore::new());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut nodes = Vec::new();
        let mut handles = Vec::new();

        for i in 0..size {
            let addr = format!("10.0.0.{}", i + 1);
            let runtime = Arc::new(MockRuntime::new());

            let watcher =
                Watcher::new(store.clone(), shutdown_rx.clone()).with_backoff(fast_backoff());
            let scheduler = Arc::new(Scheduler::new(
                addr.clone(),
                store.clone(),
                runtime.clone(),
                watcher,
                scheduler_config(),
            ));
            let register = Arc::new(Register::new(
                addr.clone(),
                store.clone(),
                runtime.clone(),
                Discovery::new("skydns.local"),
                shutdown_rx.clone(),
            ));
            handles.push(scheduler.start());
            handles.push(register.start());
            nodes.push(TestNode { addr, runtime });
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        Self { store, nodes, shutdown, handles }
    }

    fn running(&self, name: &str) -> Vec<&TestNode> {
        self.nodes
            .iter()
            .filter(|n| n.runtime.running_names().iter().any(|r| r == name))
            .collect()
    }

    fn slot_keys(&self) -> Vec<String> {
        self.store
            .keys()
            .into_iter()
            .filter(|k| k.starts_with("/apps/shop/api/hosts/"))
            .collect()
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        for handle in self.handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}

/// Poll `condition` until it holds, failing after two seconds.
async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Let in-flight reactions finish so a count that looks settled stays settled.
async fn quiesce() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test]
async fn test_single_replica_runs_on_exactly_one_node() {
    let cluster = TestCluster::start(3).await;
    cluster.store.set(MANIFEST_KEY, &manifest(1)).await.unwrap();

    eventually("one running replica", || cluster.running("shop---api").len() == 1).await;
    quiesce().await;

    let running = cluster.running("shop---api");
    assert_eq!(running.len(), 1);
    let winner = running[0];

    let pulled = winner.runtime.pulled_images();
    assert_eq!(pulled.len(), 1);
    assert_eq!(pulled[0].repository, "nginx");
    assert_eq!(pulled[0].tag, "1.18");

    assert_eq!(cluster.slot_keys().len(), 1);

    let keys = cluster.store.keys();
    assert!(keys
        .iter()
        .any(|k| k.starts_with(&format!("/hosts/{}/containers/", winner.addr))));
    let ann = cluster
        .store
        .get("/skydns/local/skydns/shop/http", false, false)
        .await
        .unwrap();
    assert!(ann.value_str().contains(&winner.addr));

    cluster.stop().await;
}

#[tokio::test]
async fn test_scale_limits_replicas_and_grows_on_update() {
    let cluster = TestCluster::start(4).await;
    cluster.store.set(MANIFEST_KEY, &manifest(2)).await.unwrap();

    eventually("two running replicas", || cluster.running("shop---api").len() == 2).await;
    quiesce().await;
    assert_eq!(cluster.running("shop---api").len(), 2);
    assert_eq!(cluster.slot_keys().len(), 2);

    cluster.store.set(MANIFEST_KEY, &manifest(3)).await.unwrap();
    eventually("three running replicas", || cluster.running("shop---api").len() == 3).await;
    quiesce().await;
    assert_eq!(cluster.running("shop---api").len(), 3);
    assert_eq!(cluster.slot_keys().len(), 3);

    cluster.stop().await;
}

#[tokio::test]
async fn test_manifest_delete_cleans_up_everything() {
    let cluster = TestCluster::start(2).await;
    cluster.store.set(MANIFEST_KEY, &manifest(1)).await.unwrap();
    eventually("one running replica", || cluster.running("shop---api").len() == 1).await;
    quiesce().await;

    cluster.store.delete(MANIFEST_KEY, false).await.unwrap();
    eventually("no containers", || {
        cluster
            .nodes
            .iter()
            .all(|n| n.runtime.container_names().is_empty())
    })
    .await;
    eventually("empty store", || cluster.store.keys().is_empty()).await;

    cluster.stop().await;
}

#[tokio::test]
async fn test_later_observer_does_not_run() {
    let store = Arc::new(MemoryStore::new());
    let (_shutdown, rx) = watch::channel(false);
    let event = WatchEvent {
        action: Action::Set,
        node: Node {
            key: MANIFEST_KEY.to_string(),
            value: Some(manifest(1)),
            ..Node::default()
        },
        prev_node: None,
    };

    let first = Arc::new(MockRuntime::new());
    let second = Arc::new(MockRuntime::new());
    let a = Scheduler::new(
        "10.0.0.1",
        store.clone(),
        first.clone(),
        Watcher::new(store.clone(), rx.clone()),
        scheduler_config(),
    );
    let b = Scheduler::new(
        "10.0.0.2",
        store.clone(),
        second.clone(),
        Watcher::new(store.clone(), rx),
        scheduler_config(),
    );

    a.handle_event(&event).await;
    b.handle_event(&event).await;

    assert_eq!(first.running_names(), vec!["shop---api"]);
    assert!(second.container_names().is_empty());
    assert!(second.pulled_images().is_empty());

    let slots = SlotTable::new(store.clone(), "observer")
        .list(&ManifestId::new("shop", "api"))
        .await
        .unwrap();
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].addr(), Some("10.0.0.1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_nodes_never_exceed_scale() {
    for (nodes, scale) in [(6usize, 1u32), (6, 2), (3, 5)] {
        let store = Arc::new(MemoryStore::new());
        let (_shutdown, rx) = watch::channel(false);
        let event = WatchEvent {
            action: Action::Set,
            node: Node {
                key: MANIFEST_KEY.to_string(),
                value: Some(manifest(scale)),
                ..Node::default()
            },
            prev_node: None,
        };

        let mut runtimes = Vec::new();
        let mut tasks = Vec::new();
        for i in 0..nodes {
            let runtime = Arc::new(MockRuntime::new());
            let scheduler = Scheduler::new(
                format!("10.0.0.{i}"),
                store.clone(),
                runtime.clone(),
                Watcher::new(store.clone(), rx.clone()),
                SchedulerConfig {
                    stagger_unit: Duration::ZERO,
                    ..scheduler_config()
                },
            );
            let event = event.clone();
            tasks.push(tokio::spawn(async move { scheduler.handle_event(&event).await }));
            runtimes.push(runtime);
        }
        for task in tasks {
            task.await.unwrap();
        }

        let running = runtimes
            .iter()
            .filter(|r| !r.running_names().is_empty())
            .count();
        assert!(running <= scale as usize, "{running} replicas for scale {scale}");
        assert!(running >= 1);
        if nodes <= scale as usize {
            assert_eq!(running, nodes);
        }

        let slots = SlotTable::new(store.clone(), "observer")
            .list(&ManifestId::new("shop", "api"))
            .await
            .unwrap();
        assert_eq!(slots.len(), running);
    }
}

#[tokio::test]
async fn test_private_containers_are_not_registered_and_get_linked() {
    let cluster = TestCluster::start(1).await;
    let node = &cluster.nodes[0];
    let ambassador = node
        .runtime
        .create_container(&CreateOptions {
            name: "__ambassador".to_string(),
            image: "ambassadord".to_string(),
            ..CreateOptions::default()
        })
        .await
        .unwrap();
    node.runtime.start_container(&ambassador).await.unwrap();
    quiesce().await;
    assert!(cluster.store.keys().is_empty());

    cluster.store.set(MANIFEST_KEY, &manifest(1)).await.unwrap();
    eventually("placed container", || cluster.running("shop---api").len() == 1).await;
    quiesce().await;

    assert_eq!(
        node.runtime.links_of("shop---api"),
        Some(vec!["__ambassador:backends".to_string()])
    );
    let load_records: Vec<String> = cluster
        .store
        .keys()
        .into_iter()
        .filter(|k| k.starts_with("/hosts/"))
        .collect();
    assert_eq!(load_records.len(), 1);
    assert!(!load_records[0].ends_with(&ambassador));

    cluster.stop().await;
}

#[tokio::test]
async fn test_placement_survives_watch_disconnect() {
    let cluster = TestCluster::start(2).await;
    cluster.store.disconnect_watchers();
    tokio::time::sleep(Duration::from_millis(60)).await;

    cluster.store.set(MANIFEST_KEY, &manifest(1)).await.unwrap();
    eventually("one running replica", || cluster.running("shop---api").len() == 1).await;

    cluster.stop().await;
}
