//! Main runtime orchestration.
//!
//! The runtime coordinates component lifecycle:
//! - Start order: store → startup reconcile → subnet leases → lease monitors
//!   → endpoint watchers → periodic reconciler
//! - Shutdown: signal every task, then join them with a bounded wait
//!
//! A revoked subnet lease is fatal: its monitor reports on the fatal channel
//! and [`Runtime::run`] stops everything and returns the error.

use crate::addr::Ipv4Subnet;
use crate::alloc::{
    AllocationRequest, AllocatorTable, FixedAddressAllocator, LeaseMonitor, RangeAllocator,
    SubnetAllocator,
};
use crate::cache::LocalCacheStore;
use crate::core::config::Config;
use crate::core::time::SystemClock;
use crate::endpoint::{EndpointRegistry, EndpointWatcher, LoggingSink};
use crate::error::{IpamError, IpamResult};
use crate::pool::{Claim, KeyLayout, Pool, PoolKind, SubnetClaim};
use crate::reconcile::{ReconcileLoop, Reconciler, SyncReport};
use crate::store::{MemoryStore, PrefixWatcher, StoreClient, WatchScope};
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Bound on how long stop waits for each task.
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Buffered updates between the endpoint watch task and its consumer.
const ENDPOINT_WATCH_CAPACITY: usize = 64;

/// Resolve once shutdown has been signalled or the sender is gone.
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}

/// Component health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    /// Component is starting.
    Starting,
    /// Component is healthy and operational.
    Healthy,
    /// Component is not configured for this node.
    Disabled,
    /// Component has failed.
    Failed,
    /// Component has stopped.
    Stopped,
}

/// Health status aggregated from all components.
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    /// Coordination store.
    pub store: ComponentHealth,
    /// Startup and periodic reconciliation.
    pub reconciler: ComponentHealth,
    /// Subnet leases and their monitors.
    pub leases: ComponentHealth,
    /// Endpoint registration and peer watch.
    pub endpoints: ComponentHealth,
}

impl Default for RuntimeHealth {
    fn default() -> Self {
        Self {
            store: ComponentHealth::Starting,
            reconciler: ComponentHealth::Starting,
            leases: ComponentHealth::Starting,
            endpoints: ComponentHealth::Starting,
        }
    }
}

impl RuntimeHealth {
    /// Check if the runtime is ready to serve allocations.
    pub fn is_ready(&self) -> bool {
        let usable = |h: ComponentHealth| matches!(h, ComponentHealth::Healthy | ComponentHealth::Disabled);
        self.store == ComponentHealth::Healthy
            && usable(self.reconciler)
            && usable(self.leases)
            && usable(self.endpoints)
    }

    /// Check if the runtime is alive (no component failed).
    pub fn is_alive(&self) -> bool {
        ![self.store, self.reconciler, self.leases, self.endpoints].contains(&ComponentHealth::Failed)
    }
}

/// Node runtime holding all component handles.
pub struct Runtime {
    /// Configuration.
    config: Arc<Config>,

    /// Identity written as owner of every claim.
    identity: String,

    /// Embedded coordination store.
    memory: Arc<MemoryStore>,

    /// Timeout-bounded store client shared by all components.
    store: StoreClient,

    layout: KeyLayout,

    cache: Arc<LocalCacheStore>,

    /// Pools built from configuration.
    pools: Vec<Pool>,

    allocators: AllocatorTable,

    subnets: Arc<SubnetAllocator>,

    reconciler: Arc<Reconciler>,

    /// Subnet leases acquired at startup.
    leases: Vec<SubnetClaim>,

    /// Runtime health status.
    health: RuntimeHealth,

    /// Whether the runtime is running.
    running: Arc<AtomicBool>,

    /// Shutdown signal sender.
    shutdown_tx: watch::Sender<bool>,

    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,

    /// Errors that must stop the node.
    fatal_tx: mpsc::Sender<IpamError>,
    fatal_rx: mpsc::Receiver<IpamError>,

    /// Background tasks by name.
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Runtime {
    /// Create a new runtime with a fresh embedded store.
    pub fn new(config: Config) -> Result<Self> {
        let memory = Arc::new(MemoryStore::with_history_limit(config.store.history_limit));
        Self::with_store(config, memory)
    }

    /// Create a runtime on an existing embedded store, so several nodes can
    /// share one store in-process.
    pub fn with_store(config: Config, memory: Arc<MemoryStore>) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let identity = config.resolve_identity()?;
        let pools = config.build_pools()?;

        let store = StoreClient::new(memory.clone(), config.request_timeout());
        let layout = KeyLayout::new(config.store.root.clone());
        let cache = Arc::new(LocalCacheStore::new(config.data_dir()));

        let subnets = Arc::new(
            SubnetAllocator::new(store.clone(), layout.clone(), Arc::new(SystemClock))
                .with_lease_ttl(config.lease_ttl()),
        );
        let allocators = AllocatorTable::new()
            .with(Arc::new(
                RangeAllocator::new(store.clone(), layout.clone()).with_cache(cache.clone()),
            ))
            .with(subnets.clone())
            .with(Arc::new(FixedAddressAllocator::new(
                store.clone(),
                layout.clone(),
                identity.clone(),
            )));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            cache.clone(),
            layout.clone(),
            identity.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (fatal_tx, fatal_rx) = mpsc::channel(8);

        Ok(Self {
            config: Arc::new(config),
            identity,
            memory,
            store,
            layout,
            cache,
            pools,
            allocators,
            subnets,
            reconciler,
            leases: Vec::new(),
            health: RuntimeHealth::default(),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
            fatal_tx,
            fatal_rx,
            tasks: Vec::new(),
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Get the embedded store.
    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    pub fn store(&self) -> &StoreClient {
        &self.store
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    pub fn cache(&self) -> &LocalCacheStore {
        &self.cache
    }

    pub fn pools(&self) -> &[Pool] {
        &self.pools
    }

    /// Look up a configured pool by name.
    pub fn pool(&self, name: &str) -> IpamResult<&Pool> {
        self.pools
            .iter()
            .find(|pool| pool.name() == name)
            .ok_or_else(|| IpamError::invalid(format!("unknown pool {}", name)))
    }

    /// Subnet leases held by this node.
    pub fn leases(&self) -> &[SubnetClaim] {
        &self.leases
    }

    /// Get the current health status.
    pub fn health(&self) -> &RuntimeHealth {
        &self.health
    }

    /// Check if the runtime is ready to serve requests.
    pub fn is_ready(&self) -> bool {
        self.health.is_ready()
    }

    /// Check if the runtime is alive.
    pub fn is_alive(&self) -> bool {
        self.health.is_alive()
    }

    /// Check if the runtime is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Get a shutdown receiver for graceful shutdown coordination.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Allocate from a configured pool on behalf of this node.
    pub async fn allocate(&self, pool: &str, request: &AllocationRequest) -> IpamResult<Claim> {
        self.allocators.allocate(self.pool(pool)?, request).await
    }

    /// Allocate one unit from `pool` owned by this node.
    pub async fn allocate_local(&self, pool: &str) -> IpamResult<Claim> {
        self.allocate(pool, &AllocationRequest::for_owner(self.identity.clone()))
            .await
    }

    pub async fn release(&self, pool: &str, claim: &Claim) -> IpamResult<()> {
        self.allocators.release(self.pool(pool)?, claim).await
    }

    /// Initialize and start all runtime components.
    ///
    /// Components are started in order:
    /// 1. Coordination store
    /// 2. Startup reconciliation of every known range pool
    /// 3. Subnet leases, one per subnet pool
    /// 4. Lease monitors
    /// 5. Endpoint registration and peer watch
    /// 6. Periodic reconciler
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(
            identity = %self.identity,
            pools = self.pools.len(),
            data_dir = %self.cache.data_dir().display(),
            "starting ipshard runtime"
        );

        // 1. Store
        self.init_store().await?;

        // 2. Startup reconcile
        self.reconcile_startup().await;

        // 3. Leases
        self.acquire_leases().await?;

        // 4. Lease monitors
        self.spawn_lease_monitors();

        // 5. Endpoints
        self.start_endpoints().await?;

        // 6. Periodic reconciler
        self.spawn_reconcile_loop();

        self.running.store(true, Ordering::Release);
        tracing::info!("ipshard runtime started");
        Ok(())
    }

    async fn init_store(&mut self) -> Result<()> {
        tracing::debug!(mode = %self.config.store.mode, "initializing coordination store");
        self.health.store = ComponentHealth::Healthy;
        tracing::info!(
            mode = %self.config.store.mode,
            root = %self.layout.root(),
            revision = self.memory.current_revision(),
            "coordination store initialized"
        );
        Ok(())
    }

    fn reconcile_loop(&self) -> ReconcileLoop {
        ReconcileLoop::new(
            self.reconciler.clone(),
            self.range_pool_names(),
            self.config.reconcile_interval(),
            self.config.reconcile.jitter_fraction,
        )
    }

    fn range_pool_names(&self) -> Vec<String> {
        self.pools
            .iter()
            .filter(|pool| pool.kind() == PoolKind::Range)
            .map(|pool| pool.name().to_string())
            .collect()
    }

    async fn reconcile_startup(&mut self) -> Vec<SyncReport> {
        let reports = self.reconcile_loop().sync_all().await;
        tracing::info!(pools = reports.len(), "startup reconcile complete");
        self.health.reconciler = ComponentHealth::Healthy;
        reports
    }

    async fn acquire_leases(&mut self) -> Result<()> {
        let subnet_pools: Vec<Pool> = self
            .pools
            .iter()
            .filter(|pool| pool.kind() == PoolKind::Subnet)
            .cloned()
            .collect();
        if subnet_pools.is_empty() {
            self.health.leases = ComponentHealth::Disabled;
            return Ok(());
        }
        for pool in &subnet_pools {
            let previous = self.previous_subnet(pool.name())?;
            let claim = self
                .subnets
                .acquire(pool, &self.identity, previous)
                .await
                .with_context(|| format!("failed to lease a subnet from pool {}", pool.name()))?;
            self.leases.push(claim);
        }
        self.health.leases = ComponentHealth::Healthy;
        Ok(())
    }

    fn previous_subnet(&self, pool: &str) -> Result<Option<Ipv4Subnet>> {
        let Some(raw) = self
            .config
            .pools
            .iter()
            .find(|p| p.name == pool)
            .and_then(|p| p.previous_subnet.as_deref())
        else {
            return Ok(None);
        };
        let subnet: Ipv4Subnet = raw
            .parse()
            .with_context(|| format!("pool {}: invalid previous_subnet {:?}", pool, raw))?;
        Ok(Some(subnet))
    }

    fn spawn_lease_monitors(&mut self) {
        for claim in self.leases.clone() {
            let monitor = LeaseMonitor::new(self.subnets.clone(), claim, self.config.renew_retry());
            let shutdown = self.shutdown_rx.clone();
            let fatal = self.fatal_tx.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = monitor.run(shutdown).await {
                    tracing::error!(error = %e, "lease monitor failed");
                    let _ = fatal.send(e).await;
                }
            });
            self.tasks.push(("lease-monitor", handle));
        }
    }

    async fn start_endpoints(&mut self) -> Result<()> {
        if self.config.endpoints.is_empty() {
            self.health.endpoints = ComponentHealth::Disabled;
            return Ok(());
        }
        let registry = EndpointRegistry::new(self.store.clone(), self.layout.clone(), self.identity.clone());
        for endpoint in &self.config.endpoints {
            let address = crate::addr::parse_addr(&endpoint.address)
                .with_context(|| format!("endpoint {}: invalid address", endpoint.device))?;
            registry
                .register(&endpoint.device, address)
                .await
                .with_context(|| format!("failed to register endpoint on {}", endpoint.device))?;
        }

        let (updates, watch_handle) = PrefixWatcher::spawn(
            self.store.clone(),
            WatchScope::Prefix(self.layout.endpoint_prefix()),
            ENDPOINT_WATCH_CAPACITY,
            self.config.watch_retry(),
            self.shutdown_rx.clone(),
        );
        let watcher = EndpointWatcher::new(self.layout.clone(), self.identity.clone(), Arc::new(LoggingSink));
        let watcher_handle = tokio::spawn(watcher.run(updates, self.shutdown_rx.clone()));
        self.tasks.push(("endpoint-watch", watch_handle));
        self.tasks.push(("endpoint-watcher", watcher_handle));

        self.health.endpoints = ComponentHealth::Healthy;
        tracing::info!(devices = self.config.endpoints.len(), "endpoint watch started");
        Ok(())
    }

    fn spawn_reconcile_loop(&mut self) {
        if !self.config.reconcile.enabled {
            tracing::info!("periodic reconcile disabled");
            return;
        }
        let run = self.reconcile_loop();
        let handle = tokio::spawn(run.run(self.shutdown_rx.clone()));
        self.tasks.push(("reconcile", handle));
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for shutdown signal.
    pub async fn wait_for_shutdown(&mut self) {
        let mut rx = self.shutdown_rx.clone();
        shutdown_requested(&mut rx).await;
    }

    /// Run the runtime until ctrl-c, a shutdown request or a fatal error.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        let outcome = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received (SIGINT)");
                Ok(())
            }
            _ = shutdown_requested(&mut shutdown_rx) => {
                tracing::info!("shutdown requested by component");
                Ok(())
            }
            Some(e) = self.fatal_rx.recv() => {
                tracing::error!(error = %e, "fatal error; stopping");
                self.health.leases = ComponentHealth::Failed;
                Err(anyhow::Error::new(e))
            }
        };

        self.stop().await?;
        outcome
    }

    /// Stop all runtime components.
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!("stopping ipshard runtime");
        self.running.store(false, Ordering::Release);

        // Signal shutdown to all components
        let _ = self.shutdown_tx.send(true);

        for (name, handle) in self.tasks.drain(..) {
            match tokio::time::timeout(TASK_STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => tracing::debug!(task = name, "task stopped"),
                Ok(Err(e)) => tracing::warn!(task = name, error = %e, "task panicked"),
                Err(_) => tracing::warn!(task = name, "task stop timed out"),
            }
        }

        for health in [
            &mut self.health.reconciler,
            &mut self.health.leases,
            &mut self.health.endpoints,
            &mut self.health.store,
        ] {
            if *health != ComponentHealth::Failed {
                *health = ComponentHealth::Stopped;
            }
        }

        tracing::info!("ipshard runtime stopped");
        Ok(())
    }

    /// Start the runtime for tests: store, startup reconcile and leases, with
    /// no background tasks or signal handling.
    pub async fn start_for_tests(&mut self) -> Result<Vec<SyncReport>> {
        self.init_store().await?;
        let reports = self.reconcile_startup().await;
        self.acquire_leases().await?;
        self.running.store(true, Ordering::Release);
        Ok(reports)
    }

    /// Stop the runtime for tests.
    pub async fn shutdown_for_tests(&mut self) -> Result<()> {
        self.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_requested_resolves_on_signal_or_drop() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        shutdown_requested(&mut rx).await;

        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        shutdown_requested(&mut rx).await;
    }

    #[test]
    fn health_readiness() {
        let mut health = RuntimeHealth::default();
        assert!(!health.is_ready());
        health.store = ComponentHealth::Healthy;
        health.reconciler = ComponentHealth::Healthy;
        health.leases = ComponentHealth::Disabled;
        health.endpoints = ComponentHealth::Disabled;
        assert!(health.is_ready());
        health.leases = ComponentHealth::Failed;
        assert!(!health.is_alive());
    }
}
