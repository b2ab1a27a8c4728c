//! Server registry and heartbeat-based peer discovery.
//!
//! Each process owns one row in `server_registry`, refreshed every
//! heartbeat. Discovery reads the ONLINE rows whose heartbeat falls within
//! the freshness window and caches them; broadcasts fan out to that cached
//! list, so it may lag true membership by up to one heartbeat interval.
//! A periodic sweep flips rows whose heartbeat aged past the window to
//! OFFLINE.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use concord_db::RegistryStore;
use concord_types::{ServerId, ServerRecord, ServerStatus};

use crate::error::CoreError;

/// Identity and timing of the local server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Display name; prefix of the generated [`ServerId`].
    pub name: String,
    /// Advertised host.
    pub address: String,
    /// Advertised port.
    pub port: u16,
    /// Player capacity.
    pub capacity: u32,
    /// Time between heartbeats.
    pub heartbeat_interval: Duration,
    /// Freshness window in heartbeat intervals.
    pub freshness_multiplier: u32,
}

impl RegistryConfig {
    /// Maximum heartbeat age of a peer still considered alive.
    pub fn freshness_window(&self) -> Duration {
        self.heartbeat_interval
            .saturating_mul(self.freshness_multiplier)
    }
}

/// Whether a heartbeat at `last_heartbeat` is still fresh at `now`.
pub fn is_fresh(last_heartbeat: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    let window = TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX);
    now.signed_duration_since(last_heartbeat) <= window
}

fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(window)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// The local server's view of the cluster.
pub struct ServerRegistry {
    server_id: ServerId,
    config: RegistryConfig,
    store: Arc<dyn RegistryStore>,
    peers: RwLock<Vec<ServerRecord>>,
    current_load: AtomicU32,
}

impl ServerRegistry {
    /// Create a registry with a freshly generated server id.
    pub fn new(config: RegistryConfig, store: Arc<dyn RegistryStore>) -> Self {
        let server_id = ServerId::generate(&config.name);
        Self {
            server_id,
            config,
            store,
            peers: RwLock::new(Vec::new()),
            current_load: AtomicU32::new(0),
        }
    }

    /// This process's server id.
    pub const fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    /// Registry configuration.
    pub const fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Report the number of connected players; sent with the next heartbeat.
    pub fn set_load(&self, load: u32) {
        self.current_load.store(load, Ordering::Relaxed);
    }

    /// Last reported load.
    pub fn current_load(&self) -> u32 {
        self.current_load.load(Ordering::Relaxed)
    }

    fn own_record(&self, status: ServerStatus, now: DateTime<Utc>) -> ServerRecord {
        ServerRecord {
            server_id: self.server_id.clone(),
            name: self.config.name.clone(),
            address: self.config.address.clone(),
            port: self.config.port,
            capacity: self.config.capacity,
            current_load: self.current_load(),
            last_heartbeat: concord_types::records::storage_precision(now),
            status,
        }
    }

    /// Upsert this server's row as ONLINE with the current time.
    pub async fn announce(&self) -> Result<(), CoreError> {
        self.announce_at(Utc::now()).await
    }

    pub(crate) async fn announce_at(&self, now: DateTime<Utc>) -> Result<(), CoreError> {
        let record = self.own_record(ServerStatus::Online, now);
        self.store.upsert_server(&record).await?;
        tracing::debug!(server_id = %self.server_id, load = record.current_load, "Heartbeat");
        Ok(())
    }

    /// Refresh the cached peer list from the store.
    pub async fn discover(&self) -> Result<Vec<ServerRecord>, CoreError> {
        self.discover_at(Utc::now()).await
    }

    pub(crate) async fn discover_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ServerRecord>, CoreError> {
        let window = self.config.freshness_window();
        let peers = self
            .store
            .fresh_peers(&self.server_id, window_start(now, window))
            .await?;

        let mut cache = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        let before: BTreeSet<&ServerId> = cache.iter().map(|p| &p.server_id).collect();
        let after: BTreeSet<&ServerId> = peers.iter().map(|p| &p.server_id).collect();
        let joined = after.difference(&before).count();
        let left = before.difference(&after).count();
        if joined > 0 || left > 0 {
            tracing::info!(
                server_id = %self.server_id,
                peers = peers.len(),
                joined,
                left,
                "Peer membership changed"
            );
        }
        cache.clone_from(&peers);
        drop(cache);
        Ok(peers)
    }

    /// The peer list from the last discovery.
    pub fn peers(&self) -> Vec<ServerRecord> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Ids of the cached peers.
    pub fn peer_ids(&self) -> Vec<ServerId> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|p| p.server_id.clone())
            .collect()
    }

    /// Flip every server whose heartbeat aged past the window to OFFLINE.
    pub async fn sweep(&self) -> Result<u64, CoreError> {
        self.sweep_at(Utc::now()).await
    }

    pub(crate) async fn sweep_at(&self, now: DateTime<Utc>) -> Result<u64, CoreError> {
        let cutoff = window_start(now, self.config.freshness_window());
        let flipped = self.store.mark_stale_offline(cutoff).await?;
        if flipped > 0 {
            tracing::info!(flipped, "Marked stale servers offline");
        }
        Ok(flipped)
    }

    /// Announce OFFLINE so peers drop this server without waiting for the
    /// freshness window.
    pub async fn mark_offline(&self) -> Result<(), CoreError> {
        self.store
            .set_status(&self.server_id, ServerStatus::Offline)
            .await?;
        tracing::info!(server_id = %self.server_id, "Announced OFFLINE");
        Ok(())
    }
}

impl std::fmt::Debug for ServerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRegistry")
            .field("server_id", &self.server_id)
            .field("config", &self.config)
            .field("peers", &self.peer_ids())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use concord_db::MemoryStore;

    use super::*;

    fn config(name: &str) -> RegistryConfig {
        RegistryConfig {
            name: name.to_owned(),
            address: "127.0.0.1".to_owned(),
            port: 25_565,
            capacity: 100,
            heartbeat_interval: Duration::from_secs(10),
            freshness_multiplier: 3,
        }
    }

    fn registry(name: &str, store: &Arc<MemoryStore>) -> ServerRegistry {
        ServerRegistry::new(config(name), Arc::clone(store) as Arc<dyn RegistryStore>)
    }

    #[test]
    fn freshness_boundary_is_inclusive() {
        let now = Utc::now();
        let window = Duration::from_secs(30);
        assert!(is_fresh(now - ChronoDuration::seconds(30), now, window));
        assert!(!is_fresh(
            now - ChronoDuration::seconds(30) - ChronoDuration::microseconds(1),
            now,
            window
        ));
    }

    #[test]
    fn server_ids_are_unique_per_instance() {
        let store = Arc::new(MemoryStore::new());
        let a = registry("alpha", &store);
        let b = registry("alpha", &store);
        assert_ne!(a.server_id(), b.server_id());
        assert!(a.server_id().as_str().starts_with("alpha-"));
    }

    #[tokio::test]
    async fn silent_peer_leaves_and_rejoins_discovery() {
        let store = Arc::new(MemoryStore::new());
        let alpha = registry("alpha", &store);
        let beta = registry("beta", &store);
        let now = Utc::now();

        alpha.announce_at(now).await.unwrap();
        beta.announce_at(now).await.unwrap();
        let peers = alpha.discover_at(now).await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(alpha.peer_ids(), vec![beta.server_id().clone()]);

        let later = now + ChronoDuration::seconds(31);
        assert!(alpha.discover_at(later).await.unwrap().is_empty());
        assert!(alpha.peers().is_empty());

        beta.announce_at(later).await.unwrap();
        assert_eq!(alpha.discover_at(later).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn discovery_excludes_self() {
        let store = Arc::new(MemoryStore::new());
        let alpha = registry("alpha", &store);
        alpha.announce().await.unwrap();
        assert!(alpha.discover().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_marks_stale_servers_offline() {
        let store = Arc::new(MemoryStore::new());
        let alpha = registry("alpha", &store);
        let beta = registry("beta", &store);
        let now = Utc::now();
        beta.announce_at(now).await.unwrap();

        assert_eq!(alpha.sweep_at(now).await.unwrap(), 0);
        assert_eq!(
            alpha.sweep_at(now + ChronoDuration::seconds(31)).await.unwrap(),
            1
        );
        let rows = store.list_servers().await.unwrap();
        assert!(rows.iter().all(|s| s.status == ServerStatus::Offline));
    }

    #[tokio::test]
    async fn offline_announcement_hides_server_immediately() {
        let store = Arc::new(MemoryStore::new());
        let alpha = registry("alpha", &store);
        let beta = registry("beta", &store);
        alpha.announce().await.unwrap();
        beta.announce().await.unwrap();
        beta.mark_offline().await.unwrap();
        assert!(alpha.discover().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn heartbeat_carries_current_load() {
        let store = Arc::new(MemoryStore::new());
        let alpha = registry("alpha", &store);
        alpha.set_load(42);
        alpha.announce().await.unwrap();
        let rows = store.list_servers().await.unwrap();
        assert_eq!(rows.first().map(|s| s.current_load), Some(42));
    }
}
