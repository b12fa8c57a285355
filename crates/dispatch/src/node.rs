//! Node wiring - builds every dispatch component from configuration
//!
//! One process hosts the registry accessor, the in-process broadcast channel,
//! the execution engine, the dispatcher, the status relay and the registration
//! ledger, and serves the three gRPC services over a single listener.

use firewatch_broadcast::{BroadcastChannel, BroadcastError, LocalBroadcast};
use firewatch_core::Config;
use firewatch_registry::{RegistryError, ResourceRegistry};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Router;
use tonic::transport::Server;
use tracing::{info, warn};

use crate::engine::{ChannelNotifier, ExecutionEngine};
use crate::grpc::{
    DispatchServer, DispatchService, ExecutionServer, ExecutionService, MonitoringServer,
    MonitoringService,
};
use crate::ledger::{EmergencyLedger, LedgerConsumer, LedgerError};
use crate::relay::StatusRelay;
use crate::selector::Dispatcher;

/// Queued "resolved" notifications between the engine and the dispatcher
const RESOLUTION_QUEUE: usize = 256;

/// Node startup and serving errors
#[derive(Debug, Error)]
pub enum NodeError {
    /// Configuration rejected
    #[error("Configuration error: {0}")]
    Config(#[from] firewatch_core::Error),

    /// Registry could not be opened or seeded
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Ledger could not be opened
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Broadcast subscription failed
    #[error("Broadcast error: {0}")]
    Broadcast(#[from] BroadcastError),

    /// Listener could not be bound
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// gRPC server failed
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// A fully wired dispatch node
pub struct FirewatchNode {
    registry: Arc<dyn ResourceRegistry>,
    broadcast: Arc<LocalBroadcast>,
    engine: ExecutionEngine,
    dispatcher: Arc<Dispatcher>,
    relay: StatusRelay,
    ledger: Option<Arc<EmergencyLedger>>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl FirewatchNode {
    /// Build every component and start the background consumers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(config: &Config) -> Result<Self, NodeError> {
        config.validate()?;

        let registry = firewatch_registry::open(&config.registry)?;
        let broadcast = Arc::new(LocalBroadcast::new(config.broadcast.capacity));
        let (notifier, resolutions) = ChannelNotifier::channel(RESOLUTION_QUEUE);

        let engine = ExecutionEngine::new(
            registry.clone(),
            broadcast.clone(),
            Arc::new(notifier),
            config,
        );
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            broadcast.clone(),
            Arc::new(engine.clone()),
            config.broadcast.registration_topic.clone(),
        ));
        let relay = StatusRelay::new(broadcast.clone(), config.broadcast.status_topic.clone());

        let shutdown = CancellationToken::new();
        let mut tasks = vec![dispatcher.spawn_resolution_listener(resolutions, shutdown.clone())];

        let ledger = if config.ledger.enabled {
            let ledger = Arc::new(match &config.ledger.path {
                Some(path) => EmergencyLedger::open(path)?,
                None => EmergencyLedger::open_in_memory()?,
            });
            let consumer = LedgerConsumer::new(
                ledger.clone(),
                broadcast.subscribe(&config.broadcast.registration_topic)?,
            );
            let token = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                consumer.run(token).await;
            }));
            Some(ledger)
        } else {
            None
        };

        info!(
            status_topic = %config.broadcast.status_topic,
            registration_topic = %config.broadcast.registration_topic,
            time_unit_ms = config.simulation.time_unit_ms,
            ledger = ledger.is_some(),
            "Firewatch node ready"
        );

        Ok(Self {
            registry,
            broadcast,
            engine,
            dispatcher,
            relay,
            ledger,
            shutdown,
            tasks,
        })
    }

    /// Resource registry accessor
    pub fn registry(&self) -> Arc<dyn ResourceRegistry> {
        self.registry.clone()
    }

    /// Shared broadcast channel
    pub fn broadcast(&self) -> Arc<LocalBroadcast> {
        self.broadcast.clone()
    }

    /// Execution engine
    pub fn engine(&self) -> ExecutionEngine {
        self.engine.clone()
    }

    /// Dispatcher
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Registration ledger, when enabled
    pub fn ledger(&self) -> Option<Arc<EmergencyLedger>> {
        self.ledger.clone()
    }

    /// Router with the Dispatch, Execution and Monitoring services
    pub fn router(&self) -> Router {
        Server::builder()
            .add_service(DispatchServer::new(DispatchService::new(
                self.dispatcher.clone(),
            )))
            .add_service(ExecutionServer::new(ExecutionService::new(
                self.engine.clone(),
            )))
            .add_service(MonitoringServer::new(MonitoringService::new(
                self.relay.clone(),
            )))
    }

    /// Bind `addr` and serve until `signal` resolves
    pub async fn serve(
        self,
        addr: SocketAddr,
        signal: impl Future<Output = ()> + Send,
    ) -> Result<(), NodeError> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_with_listener(listener, signal).await
    }

    /// Serve on an already bound listener until `signal` resolves, then shut down
    pub async fn serve_with_listener(
        self,
        listener: TcpListener,
        signal: impl Future<Output = ()> + Send,
    ) -> Result<(), NodeError> {
        info!("Firewatch gRPC services listening on {}", listener.local_addr()?);

        let result = self
            .router()
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
            .await;

        self.shutdown().await;
        result.map_err(NodeError::from)
    }

    /// Cancel executions, stop consumers and close the broadcast channel
    pub async fn shutdown(self) {
        info!("Firewatch node shutting down");
        self.engine.shutdown().await;
        self.shutdown.cancel();
        self.broadcast.close();

        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Background task failed during shutdown: {}", e);
            }
        }

        let pending = self.engine.pending_reconciliation();
        if !pending.is_empty() {
            warn!(resources = ?pending, "Resources awaiting reconciliation at shutdown");
        }
    }
}
