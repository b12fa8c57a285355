//! Test utilities for end-to-end dispatch tests

use firewatch_broadcast::LocalBroadcast;
use firewatch_core::config::ResourceSeed;
use firewatch_core::{Config, ResourceRecord};
use firewatch_dispatch::grpc::{DispatchClient, ExecutionClient, MonitoringClient, StatusUpdate};
use firewatch_dispatch::{Dispatcher, EmergencyLedger, FirewatchNode, NodeError};
use firewatch_registry::ResourceRegistry;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::Streaming;

/// Upper bound for anything a test waits on
pub const WAIT_LIMIT: Duration = Duration::from_secs(10);

/// Config with fast simulated time and the given resources
pub fn test_config(resources: &[(&str, i32, i32)]) -> Config {
    let mut config = Config::default_config();
    config.node.listen_addr = "127.0.0.1:0".to_string();
    config.registry.resources = resources
        .iter()
        .map(|(id, lat, lon)| ResourceSeed::new(*id, *lat, *lon))
        .collect();
    config.simulation.time_unit_ms = 5;
    config.retry.first_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config
}

/// A node serving on an ephemeral port
pub struct TestNode {
    pub url: String,
    pub registry: Arc<dyn ResourceRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub ledger: Option<Arc<EmergencyLedger>>,
    pub broadcast: Arc<LocalBroadcast>,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<(), NodeError>>,
}

impl TestNode {
    pub async fn dispatch_client(&self) -> DispatchClient<Channel> {
        DispatchClient::connect(self.url.clone())
            .await
            .expect("Failed to connect Dispatch client")
    }

    pub async fn execution_client(&self) -> ExecutionClient<Channel> {
        ExecutionClient::connect(self.url.clone())
            .await
            .expect("Failed to connect Execution client")
    }

    pub async fn monitoring_client(&self) -> MonitoringClient<Channel> {
        MonitoringClient::connect(self.url.clone())
            .await
            .expect("Failed to connect Monitoring client")
    }

    /// Current record of a resource
    pub fn resource(&self, id: &str) -> ResourceRecord {
        self.registry.find_by_id(id).expect("Resource missing")
    }

    /// Poll the registry until `check` holds for resource `id`
    pub async fn wait_for_resource(
        &self,
        id: &str,
        check: impl Fn(&ResourceRecord) -> bool,
    ) -> ResourceRecord {
        let deadline = Instant::now() + WAIT_LIMIT;
        loop {
            let record = self.resource(id);
            if check(&record) {
                return record;
            }
            assert!(
                Instant::now() < deadline,
                "Resource {} never reached the expected state, last seen {:?}",
                id,
                record
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until the dispatcher no longer tracks `name`
    pub async fn wait_until_resolved(&self, name: &str) {
        let deadline = Instant::now() + WAIT_LIMIT;
        while self.dispatcher.is_in_flight(name) {
            assert!(Instant::now() < deadline, "Emergency {} never resolved", name);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until `topic` has exactly `expected` receivers
    pub async fn wait_for_subscribers(&self, topic: &str, expected: usize) {
        let deadline = Instant::now() + WAIT_LIMIT;
        loop {
            let count = self.broadcast.subscriber_count(topic);
            if count == expected {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "Topic {} has {} receivers, expected {}",
                topic,
                count,
                expected
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stop serving and shut every component down
    pub async fn stop(self) {
        self.shutdown.cancel();
        match tokio::time::timeout(WAIT_LIMIT, self.handle).await {
            Ok(joined) => joined
                .expect("Node task panicked")
                .expect("Node failed while serving"),
            Err(_) => tracing::warn!("Node did not stop within {:?}", WAIT_LIMIT),
        }
    }
}

/// Build a node from `config` and serve it on 127.0.0.1 with an OS-assigned port
pub async fn start_node(config: Config) -> TestNode {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());

    let node = FirewatchNode::build(&config).expect("Failed to build node");
    let registry = node.registry();
    let dispatcher = node.dispatcher();
    let ledger = node.ledger();
    let broadcast = node.broadcast();

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let handle = tokio::spawn(async move {
        node.serve_with_listener(listener, async move { signal.cancelled().await })
            .await
    });

    // Wait for server to start
    tokio::time::sleep(Duration::from_millis(100)).await;

    TestNode {
        url,
        registry,
        dispatcher,
        ledger,
        broadcast,
        shutdown,
        handle,
    }
}

/// Read a status stream to its end
pub async fn collect_updates(mut stream: Streaming<StatusUpdate>) -> Vec<StatusUpdate> {
    let mut updates = Vec::new();
    loop {
        let next = tokio::time::timeout(WAIT_LIMIT, stream.message())
            .await
            .expect("Status stream stalled");
        match next.expect("Status stream failed") {
            Some(update) => updates.push(update),
            None => return updates,
        }
    }
}

/// Status labels of a sequence of updates
pub fn statuses(updates: &[StatusUpdate]) -> Vec<&str> {
    updates.iter().map(|u| u.status.as_str()).collect()
}
