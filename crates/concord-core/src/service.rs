//! The sync service context object.
//!
//! [`SyncService`] owns every long-lived piece of a running node (pool,
//! stores, registry, bus, reconciler, state service, scheduler) and
//! sequences startup and shutdown:
//!
//! ```text
//! start:    migrate -> announce -> discover -> spawn periodic jobs
//!           heartbeat (announce + discover), sweep, reconcile, push
//! shutdown: stop jobs -> final push -> notice + OFFLINE -> drain -> close
//! ```
//!
//! A store that is unreachable or fails migration leaves the service
//! running in degraded mode: state reads return defaults and no periodic
//! sync jobs are scheduled.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use concord_db::{MigrationReport, Migrator, PoolManager, Stores};
use concord_types::{MessageId, ServerId, ServerNotice, SyncPayload};
use uuid::Uuid;

use crate::bus::{Dispatcher, MessageBus, NotificationSink, StateApplier};
use crate::config::ConcordConfig;
use crate::error::CoreError;
use crate::reconciler::Reconciler;
use crate::registry::ServerRegistry;
use crate::scheduler::Scheduler;
use crate::state::StateService;

/// A running Concord node.
pub struct SyncService {
    pool: PoolManager,
    registry: Arc<ServerRegistry>,
    bus: Arc<MessageBus>,
    reconciler: Arc<Reconciler>,
    state: StateService,
    scheduler: Scheduler,
    migration: Option<MigrationReport>,
    shutdown_grace: Duration,
}

impl SyncService {
    /// Start a node on `PostgreSQL`-backed stores.
    ///
    /// Runs schema migrations first. A disabled pool or a failed migration
    /// does not fail startup; the node comes up degraded.
    pub async fn start(
        config: &ConcordConfig,
        pool: PoolManager,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let migration = match Migrator::new(&pool).run().await {
            Ok(report) => {
                if !report.skipped {
                    tracing::info!(
                        applied = report.applied.len(),
                        already_applied = report.already_applied,
                        "Schema migrations complete"
                    );
                }
                Some(report)
            }
            Err(e) => {
                tracing::error!(error = %e, "Schema migration failed, store-backed features disabled");
                None
            }
        };

        let active = pool.is_enabled();
        let stores = Stores::postgres(&pool);
        let mut service = Self::assemble(config, pool, &stores, sink, active).await;
        service.migration = migration;
        service
    }

    /// Start a node on caller-supplied stores.
    ///
    /// `pool` still provides the background executor and is closed on
    /// shutdown; it may be a disabled pool when the stores are in memory.
    pub async fn with_stores(
        config: &ConcordConfig,
        pool: PoolManager,
        stores: &Stores,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self::assemble(config, pool, stores, sink, true).await
    }

    async fn assemble(
        config: &ConcordConfig,
        pool: PoolManager,
        stores: &Stores,
        sink: Arc<dyn NotificationSink>,
        active: bool,
    ) -> Self {
        let registry_config = config.registry_config();
        let heartbeat = registry_config.heartbeat_interval;
        let registry = Arc::new(ServerRegistry::new(
            registry_config,
            Arc::clone(&stores.registry),
        ));
        let server_id = registry.server_id().clone();
        let bus = Arc::new(MessageBus::new(
            Arc::clone(&registry),
            Arc::clone(&stores.messages),
        ));
        let executor = pool.executor().clone();
        let state = StateService::new(server_id.clone(), Arc::clone(&stores.state), executor.clone());
        let dispatcher = Dispatcher::new(
            StateApplier::new(Arc::clone(&stores.state), state.cache()),
            sink,
        );
        let reconciler = Arc::new(Reconciler::new(
            server_id.clone(),
            config.reconciler_config(),
            Arc::clone(&stores.messages),
            Arc::clone(&stores.checkpoints),
            Arc::clone(&stores.state),
            dispatcher,
            Arc::clone(&bus),
        ));
        let scheduler = Scheduler::new(executor);

        let service = Self {
            pool,
            registry,
            bus,
            reconciler,
            state,
            scheduler,
            migration: None,
            shutdown_grace: config.shutdown_grace(),
        };

        if !active {
            tracing::warn!(server_id = %server_id, "Store unavailable, running without cross-server sync");
            return service;
        }

        if let Err(e) = service.registry.announce().await {
            tracing::warn!(error = %e, "Initial announce failed");
        }
        if let Err(e) = service.registry.discover().await {
            tracing::warn!(error = %e, "Initial discovery failed");
        }
        service.schedule(
            heartbeat,
            Duration::from_secs(config.sync.sweep_interval_secs.max(1)),
            Duration::from_secs(config.sync.reconcile_interval_secs.max(1)),
        );

        tracing::info!(
            server_id = %server_id,
            peers = service.registry.peers().len(),
            "Sync service started"
        );
        service
    }

    fn schedule(&self, heartbeat: Duration, sweep: Duration, reconcile: Duration) {
        let registry = Arc::clone(&self.registry);
        self.scheduler.spawn_periodic("heartbeat", heartbeat, move || {
            let registry = Arc::clone(&registry);
            async move {
                registry.announce().await?;
                registry.discover().await.map(|_| ())
            }
        });

        let registry = Arc::clone(&self.registry);
        self.scheduler.spawn_periodic("sweep", sweep, move || {
            let registry = Arc::clone(&registry);
            async move { registry.sweep().await.map(|_| ()) }
        });

        let reconciler = Arc::clone(&self.reconciler);
        self.scheduler.spawn_periodic("reconcile", reconcile, move || {
            let reconciler = Arc::clone(&reconciler);
            async move { reconciler.reconcile_once().await.map(|_| ()) }
        });

        let reconciler = Arc::clone(&self.reconciler);
        self.scheduler.spawn_periodic("push_deltas", reconcile, move || {
            let reconciler = Arc::clone(&reconciler);
            async move { reconciler.push_deltas().await.map(|_| ()) }
        });
    }

    /// This process's server id.
    pub fn server_id(&self) -> &ServerId {
        self.registry.server_id()
    }

    /// Gameplay-facing state access.
    pub const fn state(&self) -> &StateService {
        &self.state
    }

    /// Cluster membership.
    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Outbound messaging.
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Inbound application and delta push.
    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// The connection pool.
    pub const fn pool(&self) -> &PoolManager {
        &self.pool
    }

    /// Result of the startup migration run, if it completed.
    pub const fn migration_report(&self) -> Option<&MigrationReport> {
        self.migration.as_ref()
    }

    /// Broadcast a [`ServerNotice`] to every known peer.
    pub async fn notify_peers(&self, text: &str) -> Result<Vec<MessageId>, CoreError> {
        let notice = SyncPayload::ServerNotice(ServerNotice {
            notice_id: Uuid::now_v7(),
            text: text.to_owned(),
            issued_at: Utc::now(),
        });
        self.bus.broadcast(&notice).await
    }

    /// Stop the node.
    ///
    /// Periodic jobs are stopped first, then pending local changes are
    /// pushed once more, peers are told we are leaving and the registry row
    /// goes OFFLINE. The configured grace period bounds the whole sequence:
    /// in-flight background writes get whatever the jobs left of it before
    /// the pool is closed.
    pub async fn shutdown(self) {
        let grace = self.shutdown_grace;
        let started = tokio::time::Instant::now();
        tracing::info!(server_id = %self.server_id(), grace_secs = grace.as_secs(), "Sync service shutting down");

        let had_jobs = self.scheduler.job_count() > 0;
        if !self.scheduler.shutdown(grace).await {
            tracing::warn!("Some periodic jobs were aborted during shutdown");
        }

        if had_jobs {
            if let Err(e) = self.reconciler.push_deltas().await {
                tracing::warn!(error = %e, "Final delta push failed");
            }
            if let Err(e) = self.notify_peers("server shutting down").await {
                tracing::warn!(error = %e, "Failed to notify peers of shutdown");
            }
            if let Err(e) = self.registry.mark_offline().await {
                tracing::warn!(error = %e, "Failed to mark server offline");
            }
        }

        let remaining = grace.saturating_sub(started.elapsed());
        if !self.pool.drain(remaining).await {
            tracing::warn!(
                in_flight = self.pool.executor().in_flight(),
                "Background writes still running after grace period"
            );
        }
        self.pool.close().await;
        tracing::info!("Sync service stopped");
    }
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService")
            .field("server_id", self.server_id())
            .field("store_enabled", &self.pool.is_enabled())
            .finish_non_exhaustive()
    }
}
