//! Sync reconciler: applies inbound messages and pushes local deltas.
//!
//! # Inbound pass
//!
//! 1. Read due rows addressed to this server, oldest first.
//! 2. Lease them (`claimed_until`). Rows another pass already leased are
//!    dropped, so overlapping passes never apply the same row twice.
//! 3. Group by logical key. Only the newest row of each group is
//!    dispatched; on success every row of the group is marked processed
//!    (the older ones are superseded).
//! 4. A failed dispatch schedules a retry with exponential backoff, or
//!    dead-letters the row once its attempts are exhausted. Undecodable
//!    rows are dead-lettered immediately.
//! 5. A store error while recording a group's outcome is logged and the
//!    pass moves on to the next group. The group's rows stay leased and
//!    come due again when the lease runs out.
//!
//! # Delta push
//!
//! For each entity category, rows written by this server whose
//! store-assigned change stamp is after the stored checkpoint are broadcast
//! to the current peers, then the checkpoint advances to the newest pushed
//! stamp. Record timestamps (`last_updated`, `ended_at`) are never used for
//! the checkpoint: they are taken before the write is queued, so they do
//! not follow commit order. Rows younger than the settle lag wait for the
//! next push.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use concord_db::{CheckpointStore, MessageStore, StateRepository, SyncEntity};
use concord_types::{MessageId, ServerId, SyncMessage, SyncPayload};
use tokio::sync::Mutex;

use crate::bus::{Dispatcher, MessageBus};
use crate::error::CoreError;

/// Bounded retries with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before a row is dead-lettered.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Delay ceiling.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based):
    /// `min(base * 2^(attempt - 1), max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1_u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Whether `attempts` failed attempts exhaust the policy.
    pub const fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// Reconciler batch and lease settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Maximum rows per pass and per entity push.
    pub batch_size: usize,
    /// How long a claimed row stays leased.
    pub claim_lease: Duration,
    /// Failure handling.
    pub retry: RetryPolicy,
    /// Minimum age of a change stamp before the row is pushed.
    pub push_settle: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            claim_lease: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            push_settle: Duration::from_secs(2),
        }
    }
}

/// Outcome of one inbound pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Rows whose payload was dispatched successfully.
    pub applied: usize,
    /// Older rows marked processed because a newer row for the same key won.
    pub superseded: usize,
    /// Rows that failed and were scheduled for retry.
    pub failed: usize,
    /// Rows dead-lettered in this pass.
    pub dead_lettered: usize,
    /// Groups whose outcome could not be recorded in the store.
    pub store_errors: usize,
    /// Another pass was already running; nothing was done.
    pub skipped_pass: bool,
}

/// Outcome of one delta push.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Actor records pushed.
    pub actors: usize,
    /// Guild records pushed.
    pub guilds: usize,
    /// Activity completions pushed.
    pub activities: usize,
    /// Outbox rows written.
    pub messages: usize,
    /// Another push was already running; nothing was done.
    pub skipped_pass: bool,
}

fn later(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// How many of a stamp-ordered batch to push and where the checkpoint
/// lands afterwards.
///
/// A full batch may have cut a run of equal stamps in half; the rows at
/// the batch's last stamp are then held back so the `> checkpoint` query
/// picks them up next time. A batch made entirely of one stamp is pushed
/// whole.
fn push_window(timestamps: &[DateTime<Utc>], limit: usize) -> (usize, Option<DateTime<Utc>>) {
    let Some(&last) = timestamps.last() else {
        return (0, None);
    };
    if timestamps.len() < limit {
        return (timestamps.len(), Some(last));
    }
    match timestamps.iter().rposition(|ts| *ts < last) {
        Some(index) => {
            let keep = index.saturating_add(1);
            (keep, timestamps.get(index).copied())
        }
        None => (timestamps.len(), Some(last)),
    }
}

/// Drives inbound application and outbound delta push for one server.
pub struct Reconciler {
    server_id: ServerId,
    config: ReconcilerConfig,
    messages: Arc<dyn MessageStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    state: Arc<dyn StateRepository>,
    dispatcher: Dispatcher,
    bus: Arc<MessageBus>,
    inbound_pass: Mutex<()>,
    push_pass: Mutex<()>,
}

impl Reconciler {
    /// Create a reconciler for `server_id`.
    pub fn new(
        server_id: ServerId,
        config: ReconcilerConfig,
        messages: Arc<dyn MessageStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        state: Arc<dyn StateRepository>,
        dispatcher: Dispatcher,
        bus: Arc<MessageBus>,
    ) -> Self {
        Self {
            server_id,
            config,
            messages,
            checkpoints,
            state,
            dispatcher,
            bus,
            inbound_pass: Mutex::new(()),
            push_pass: Mutex::new(()),
        }
    }

    /// Run one inbound pass.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport, CoreError> {
        let Ok(_pass) = self.inbound_pass.try_lock() else {
            tracing::debug!("Reconcile pass already running, skipped");
            return Ok(ReconcileReport {
                skipped_pass: true,
                ..ReconcileReport::default()
            });
        };

        let now = Utc::now();
        let due = self
            .messages
            .pending_for(&self.server_id, now, self.config.batch_size)
            .await?;
        if due.is_empty() {
            return Ok(ReconcileReport::default());
        }

        let ids: Vec<MessageId> = due.iter().map(|m| m.id).collect();
        let lease_until = later(now, self.config.claim_lease);
        let claimed: HashSet<MessageId> = self
            .messages
            .claim(&ids, lease_until, now)
            .await?
            .into_iter()
            .collect();

        let mut groups: BTreeMap<String, Vec<SyncMessage>> = BTreeMap::new();
        for message in due.into_iter().filter(|m| claimed.contains(&m.id)) {
            groups
                .entry(message.logical_key.clone())
                .or_default()
                .push(message);
        }

        let mut report = ReconcileReport::default();
        for (key, mut rows) in groups {
            rows.sort_by_key(|m| (m.created_at, m.id));
            let Some(newest) = rows.pop() else {
                continue;
            };
            if let Err(e) = self.apply_group(&key, &newest, &rows, now, &mut report).await {
                tracing::warn!(
                    message_id = %newest.id,
                    logical_key = %key,
                    error = %e,
                    "Could not record sync outcome, rows stay leased"
                );
                report.store_errors = report.store_errors.saturating_add(1);
            }
        }

        if report != ReconcileReport::default() {
            tracing::info!(
                server_id = %self.server_id,
                applied = report.applied,
                superseded = report.superseded,
                failed = report.failed,
                dead_lettered = report.dead_lettered,
                store_errors = report.store_errors,
                "Reconcile pass complete"
            );
        }
        Ok(report)
    }

    async fn apply_group(
        &self,
        key: &str,
        newest: &SyncMessage,
        older: &[SyncMessage],
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<(), CoreError> {
        let payload = match newest.decode() {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                let reason = format!("unknown message type {}", newest.message_type);
                return self.dead_letter(newest, &reason, now, report).await;
            }
            Err(e) => {
                tracing::warn!(message_id = %newest.id, logical_key = key, error = %e, "Undecodable sync payload");
                return self
                    .dead_letter(newest, &format!("undecodable payload: {e}"), now, report)
                    .await;
            }
        };

        match self.dispatcher.dispatch(&newest.from_server, &payload).await {
            Ok(_) => {
                let mut done: Vec<MessageId> = older.iter().map(|m| m.id).collect();
                done.push(newest.id);
                self.messages.mark_processed(&done).await?;
                report.applied = report.applied.saturating_add(1);
                report.superseded = report.superseded.saturating_add(older.len());
                Ok(())
            }
            Err(e) => {
                let attempts = newest.attempts.saturating_add(1);
                if self.config.retry.is_exhausted(attempts) {
                    return self.dead_letter(newest, &e.to_string(), now, report).await;
                }
                let delay = self.config.retry.backoff(attempts);
                tracing::warn!(
                    message_id = %newest.id,
                    kind = %payload.kind(),
                    attempts,
                    retry_in_secs = delay.as_secs(),
                    error = %e,
                    "Sync handler failed, will retry"
                );
                self.messages
                    .record_failure(newest.id, &e.to_string(), later(now, delay), false)
                    .await?;
                report.failed = report.failed.saturating_add(1);
                Ok(())
            }
        }
    }

    async fn dead_letter(
        &self,
        message: &SyncMessage,
        reason: &str,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<(), CoreError> {
        tracing::warn!(
            message_id = %message.id,
            message_type = %message.message_type,
            from = %message.from_server,
            reason,
            "Sync message dead-lettered"
        );
        self.messages
            .record_failure(message.id, reason, now, true)
            .await?;
        report.dead_lettered = report.dead_lettered.saturating_add(1);
        Ok(())
    }

    /// Dead-lettered rows addressed to this server, newest first.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<SyncMessage>, CoreError> {
        Ok(self.messages.dead_letters(&self.server_id, limit).await?)
    }

    /// Broadcast local changes newer than each entity's checkpoint.
    ///
    /// With no peers nothing is pushed and checkpoints stay put.
    pub async fn push_deltas(&self) -> Result<PushReport, CoreError> {
        let Ok(_pass) = self.push_pass.try_lock() else {
            return Ok(PushReport {
                skipped_pass: true,
                ..PushReport::default()
            });
        };
        let mut report = PushReport::default();
        if self.bus.peer_count() == 0 {
            return Ok(report);
        }

        for entity in SyncEntity::ALL {
            let since = self
                .checkpoints
                .load_checkpoint(&self.server_id, entity)
                .await?
                .unwrap_or(DateTime::UNIX_EPOCH);
            let (payloads, checkpoint) = self.collect_changes(entity, since).await?;
            if payloads.is_empty() {
                continue;
            }

            let written = self.bus.broadcast_all(&payloads).await?;
            if let Some(checkpoint) = checkpoint {
                self.checkpoints
                    .save_checkpoint(&self.server_id, entity, checkpoint)
                    .await?;
            }

            report.messages = report.messages.saturating_add(written.len());
            match entity {
                SyncEntity::Actor => report.actors = payloads.len(),
                SyncEntity::Guild => report.guilds = payloads.len(),
                SyncEntity::Activity => report.activities = payloads.len(),
            }
        }

        if report.messages > 0 {
            tracing::info!(
                actors = report.actors,
                guilds = report.guilds,
                activities = report.activities,
                messages = report.messages,
                "Pushed local deltas"
            );
        }
        Ok(report)
    }

    async fn collect_changes(
        &self,
        entity: SyncEntity,
        since: DateTime<Utc>,
    ) -> Result<(Vec<SyncPayload>, Option<DateTime<Utc>>), CoreError> {
        let limit = self.config.batch_size;
        let settle = self.config.push_settle;
        let origin = &self.server_id;
        let (stamps, payloads): (Vec<DateTime<Utc>>, Vec<SyncPayload>) = match entity {
            SyncEntity::Actor => self
                .state
                .actors_changed_since(since, settle, origin, limit)
                .await?
                .into_iter()
                .map(|c| (c.changed_at, SyncPayload::ActorUpdate(Box::new(c.record))))
                .unzip(),
            SyncEntity::Guild => self
                .state
                .guilds_changed_since(since, settle, origin, limit)
                .await?
                .into_iter()
                .map(|c| (c.changed_at, SyncPayload::GuildUpdate(Box::new(c.record))))
                .unzip(),
            SyncEntity::Activity => self
                .state
                .activities_changed_since(since, settle, origin, limit)
                .await?
                .into_iter()
                .map(|c| (c.changed_at, SyncPayload::ActivityCompleted(Box::new(c.record))))
                .unzip(),
        };

        let (keep, checkpoint) = push_window(&stamps, limit);
        let mut payloads = payloads;
        payloads.truncate(keep);
        Ok((payloads, checkpoint))
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("server_id", &self.server_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use concord_db::{BackgroundExecutor, ExecutorConfig, MemoryStore, NewMessage, RegistryStore};
    use concord_types::{
        ActivityCompletion, ActivityTier, ActorId, ActorState, CompletionId, MessageKind,
        RaidInvitation, ServerNotice,
    };
    use uuid::Uuid;

    use super::*;
    use crate::bus::{NotificationSink, StateApplier};
    use crate::cache::StateCache;
    use crate::registry::{RegistryConfig, ServerRegistry};
    use crate::state::StateService;

    #[derive(Default)]
    struct CountingSink {
        invitations: AtomicUsize,
        notices: AtomicUsize,
        completions: AtomicUsize,
        fail_notices: bool,
        /// Takes this store down while the first notice is handled and
        /// brings it back on the next one.
        outage_on_first_notice: Option<Arc<MemoryStore>>,
    }

    #[async_trait]
    impl NotificationSink for CountingSink {
        async fn on_raid_invitation(
            &self,
            _from: &ServerId,
            _invitation: &RaidInvitation,
        ) -> Result<(), CoreError> {
            tokio::task::yield_now().await;
            self.invitations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_server_notice(
            &self,
            _from: &ServerId,
            _notice: &ServerNotice,
        ) -> Result<(), CoreError> {
            let seen = self.notices.fetch_add(1, Ordering::SeqCst);
            if let Some(store) = &self.outage_on_first_notice {
                store.set_unavailable(seen == 0);
            }
            if self.fail_notices {
                return Err(CoreError::handler(MessageKind::ServerNotice, "sink offline"));
            }
            Ok(())
        }

        async fn on_activity_completed(&self, _activity: &ActivityCompletion) -> Result<(), CoreError> {
            self.completions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Node {
        registry: Arc<ServerRegistry>,
        bus: Arc<MessageBus>,
        state: StateService,
        reconciler: Reconciler,
    }

    fn node(name: &str, store: &Arc<MemoryStore>, sink: Arc<CountingSink>, retry: RetryPolicy) -> Node {
        let registry = Arc::new(ServerRegistry::new(
            RegistryConfig {
                name: name.to_owned(),
                address: "127.0.0.1".to_owned(),
                port: 25_565,
                capacity: 100,
                heartbeat_interval: std::time::Duration::from_secs(10),
                freshness_multiplier: 3,
            },
            Arc::clone(store) as Arc<dyn RegistryStore>,
        ));
        let bus = Arc::new(MessageBus::new(
            Arc::clone(&registry),
            Arc::clone(store) as Arc<dyn MessageStore>,
        ));
        let state = StateService::new(
            registry.server_id().clone(),
            Arc::clone(store) as Arc<dyn StateRepository>,
            BackgroundExecutor::new(&ExecutorConfig::default()),
        );
        let dispatcher = Dispatcher::new(
            StateApplier::new(Arc::clone(store) as Arc<dyn StateRepository>, state.cache()),
            sink,
        );
        let reconciler = Reconciler::new(
            registry.server_id().clone(),
            ReconcilerConfig {
                retry,
                push_settle: Duration::ZERO,
                ..ReconcilerConfig::default()
            },
            Arc::clone(store) as Arc<dyn MessageStore>,
            Arc::clone(store) as Arc<dyn CheckpointStore>,
            Arc::clone(store) as Arc<dyn StateRepository>,
            dispatcher,
            Arc::clone(&bus),
        );
        Node {
            registry,
            bus,
            state,
            reconciler,
        }
    }

    async fn pair(store: &Arc<MemoryStore>, sink: Arc<CountingSink>) -> (Node, Node) {
        let alpha = node("alpha", store, Arc::default(), RetryPolicy::default());
        let beta = node("beta", store, sink, RetryPolicy::default());
        alpha.registry.announce().await.unwrap();
        beta.registry.announce().await.unwrap();
        alpha.registry.discover().await.unwrap();
        (alpha, beta)
    }

    fn completion(ended_at: DateTime<Utc>) -> ActivityCompletion {
        ActivityCompletion {
            id: CompletionId::new(),
            activity_id: "crypt-of-ash".to_owned(),
            participants: vec![ActorId::new()],
            started_at: ended_at - ChronoDuration::minutes(20),
            ended_at,
            score: 1_200,
            tier: ActivityTier::Heroic,
            success: true,
            flawless: false,
            origin_server: None,
        }
    }

    fn invitation(host: &ServerId) -> SyncPayload {
        SyncPayload::RaidInvitation(RaidInvitation {
            invitation_id: Uuid::now_v7(),
            activity_id: "crypt-of-ash".to_owned(),
            party_leader: ActorId::new(),
            invitees: vec![ActorId::new()],
            host_server: host.clone(),
            expires_at: Utc::now() + ChronoDuration::minutes(5),
        })
    }

    fn notice() -> SyncPayload {
        SyncPayload::ServerNotice(ServerNotice {
            notice_id: Uuid::now_v7(),
            text: "maintenance".to_owned(),
            issued_at: Utc::now(),
        })
    }

    #[test]
    fn backoff_doubles_up_to_the_ceiling() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(5));
        assert_eq!(policy.backoff(2), Duration::from_secs(10));
        assert_eq!(policy.backoff(4), Duration::from_secs(40));
        assert_eq!(policy.backoff(10), Duration::from_secs(300));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(300));
        assert!(!policy.is_exhausted(4));
        assert!(policy.is_exhausted(5));
    }

    #[test]
    fn push_window_holds_back_a_split_timestamp_run() {
        let t0 = Utc::now();
        let t1 = t0 + ChronoDuration::seconds(1);
        assert_eq!(push_window(&[], 3), (0, None));
        assert_eq!(push_window(&[t0, t1], 3), (2, Some(t1)));
        assert_eq!(push_window(&[t0, t1, t1], 3), (1, Some(t0)));
        assert_eq!(push_window(&[t1, t1, t1], 3), (3, Some(t1)));
    }

    #[tokio::test]
    async fn racing_passes_apply_an_invitation_once() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(CountingSink::default());
        let alpha = node("alpha", &store, Arc::default(), RetryPolicy::default());
        let beta = node("beta", &store, Arc::clone(&sink), RetryPolicy::default());
        let beta_id = beta.registry.server_id().clone();
        let twin = Reconciler::new(
            beta_id.clone(),
            ReconcilerConfig::default(),
            Arc::clone(&store) as Arc<dyn MessageStore>,
            Arc::clone(&store) as Arc<dyn CheckpointStore>,
            Arc::clone(&store) as Arc<dyn StateRepository>,
            Dispatcher::new(
                StateApplier::new(
                    Arc::clone(&store) as Arc<dyn StateRepository>,
                    Arc::new(StateCache::new()),
                ),
                Arc::clone(&sink) as Arc<dyn NotificationSink>,
            ),
            Arc::clone(&beta.bus),
        );

        alpha
            .bus
            .send(&beta_id, &invitation(alpha.registry.server_id()))
            .await
            .unwrap();

        let (same_process_a, same_process_b, other) = tokio::join!(
            beta.reconciler.reconcile_once(),
            beta.reconciler.reconcile_once(),
            twin.reconcile_once()
        );
        let reports = [same_process_a.unwrap(), same_process_b.unwrap(), other.unwrap()];
        let applied: usize = reports.iter().map(|r| r.applied).sum();

        assert_eq!(applied, 1);
        assert_eq!(sink.invitations.load(Ordering::SeqCst), 1);
        assert!(store.all_messages().iter().all(|m| m.processed));

        let again = beta.reconciler.reconcile_once().await.unwrap();
        assert_eq!(again, ReconcileReport::default());
        assert_eq!(sink.invitations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn newest_row_per_key_wins() {
        let store = Arc::new(MemoryStore::new());
        let beta = node("beta", &store, Arc::default(), RetryPolicy::default());
        let alpha_id = ServerId::generate("alpha");
        let beta_id = beta.registry.server_id().clone();
        let actor_id = ActorId::new();
        let base = Utc::now();

        let mut versions = Vec::new();
        for (offset, deaths) in [(0, 1_u32), (1, 2), (2, 3)] {
            let mut actor = ActorState::new_default(actor_id);
            actor.death_count = deaths;
            actor.last_updated = base + ChronoDuration::seconds(offset);
            let payload = SyncPayload::ActorUpdate(Box::new(actor));
            versions.push(NewMessage {
                from_server: alpha_id.clone(),
                to_server: beta_id.clone(),
                kind: payload.kind(),
                logical_key: payload.logical_key(),
                payload: payload.encode_body().unwrap(),
            });
        }
        store.enqueue(&versions).await.unwrap();

        let report = beta.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.superseded, 2);
        let stored = store.load_actor(actor_id).await.unwrap().unwrap();
        assert_eq!(stored.death_count, 3);
    }

    #[tokio::test]
    async fn failing_handler_backs_off_then_dead_letters() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(CountingSink {
            fail_notices: true,
            ..CountingSink::default()
        });
        let retry = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        };
        let beta = node("beta", &store, Arc::clone(&sink), retry);
        let alpha = node("alpha", &store, Arc::default(), RetryPolicy::default());
        alpha
            .bus
            .send(beta.registry.server_id(), &notice())
            .await
            .unwrap();

        let first = beta.reconciler.reconcile_once().await.unwrap();
        assert_eq!(first.failed, 1);
        let second = beta.reconciler.reconcile_once().await.unwrap();
        assert_eq!(second.dead_lettered, 1);
        let third = beta.reconciler.reconcile_once().await.unwrap();
        assert_eq!(third, ReconcileReport::default());

        assert_eq!(sink.notices.load(Ordering::SeqCst), 2);
        let dead = beta.reconciler.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead.iter().all(|m| !m.processed && m.attempts == 2));
    }

    #[tokio::test]
    async fn undecodable_row_is_dead_lettered() {
        let store = Arc::new(MemoryStore::new());
        let beta = node("beta", &store, Arc::default(), RetryPolicy::default());
        store
            .enqueue(&[NewMessage {
                from_server: ServerId::generate("alpha"),
                to_server: beta.registry.server_id().clone(),
                kind: MessageKind::ActorUpdate,
                logical_key: "actor:broken".to_owned(),
                payload: "{not json".to_owned(),
            }])
            .await
            .unwrap();

        let report = beta.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.applied, 0);
    }

    #[tokio::test]
    async fn push_deltas_broadcasts_local_changes_once() {
        let store = Arc::new(MemoryStore::new());
        let alpha = node("alpha", &store, Arc::default(), RetryPolicy::default());
        let beta = node("beta", &store, Arc::default(), RetryPolicy::default());
        alpha.registry.announce().await.unwrap();
        beta.registry.announce().await.unwrap();
        alpha.registry.discover().await.unwrap();

        let mut actor = ActorState::new_default(ActorId::new());
        actor.origin_server = Some(alpha.registry.server_id().clone());
        actor.last_updated = concord_types::records::storage_precision(Utc::now());
        store.save_actor(&actor).await.unwrap();

        let mut foreign = ActorState::new_default(ActorId::new());
        foreign.origin_server = Some(beta.registry.server_id().clone());
        foreign.last_updated = actor.last_updated;
        store.save_actor(&foreign).await.unwrap();

        let first = alpha.reconciler.push_deltas().await.unwrap();
        assert_eq!(first.actors, 1);
        assert_eq!(first.messages, 1);

        let second = alpha.reconciler.push_deltas().await.unwrap();
        assert_eq!(second.messages, 0);

        let report = beta.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.applied, 1);
    }

    #[tokio::test]
    async fn push_without_peers_keeps_checkpoint() {
        let store = Arc::new(MemoryStore::new());
        let alpha = node("alpha", &store, Arc::default(), RetryPolicy::default());
        let mut actor = ActorState::new_default(ActorId::new());
        actor.origin_server = Some(alpha.registry.server_id().clone());
        actor.last_updated = Utc::now();
        store.save_actor(&actor).await.unwrap();

        let report = alpha.reconciler.push_deltas().await.unwrap();
        assert_eq!(report, PushReport::default());
        let checkpoint = store
            .load_checkpoint(alpha.registry.server_id(), SyncEntity::Actor)
            .await
            .unwrap();
        assert!(checkpoint.is_none());
    }

    #[tokio::test]
    async fn store_error_on_one_group_does_not_stop_the_pass() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(CountingSink {
            outage_on_first_notice: Some(Arc::clone(&store)),
            ..CountingSink::default()
        });
        let beta = node("beta", &store, Arc::clone(&sink), RetryPolicy::default());
        let alpha = node("alpha", &store, Arc::default(), RetryPolicy::default());
        for _ in 0..2 {
            alpha
                .bus
                .send(beta.registry.server_id(), &notice())
                .await
                .unwrap();
        }

        let report = beta.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.store_errors, 1);
        assert_eq!(report.applied, 1);
        assert_eq!(sink.notices.load(Ordering::SeqCst), 2);

        let rows = store.all_messages();
        assert_eq!(rows.iter().filter(|m| m.processed).count(), 1);
        assert!(rows.iter().all(|m| m.attempts == 0 && !m.dead_lettered));

        let leased = beta.reconciler.reconcile_once().await.unwrap();
        assert_eq!(leased, ReconcileReport::default());
        assert_eq!(sink.notices.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn activity_recorded_after_a_push_is_pushed_despite_an_earlier_end() {
        let store = Arc::new(MemoryStore::new());
        let (alpha, beta) = pair(&store, Arc::default()).await;
        let now = Utc::now();

        alpha.state.record_activity(completion(now)).wait().await.unwrap();
        let first = alpha.reconciler.push_deltas().await.unwrap();
        assert_eq!(first.activities, 1);

        let late = completion(now - ChronoDuration::seconds(5));
        let late_id = late.id;
        alpha.state.record_activity(late).wait().await.unwrap();
        let second = alpha.reconciler.push_deltas().await.unwrap();
        assert_eq!(second.activities, 1);
        assert!(
            store
                .all_messages()
                .iter()
                .any(|m| m.to_server == *beta.registry.server_id()
                    && m.logical_key == format!("activity:{late_id}"))
        );
    }

    #[tokio::test]
    async fn actor_saved_after_a_push_is_pushed_despite_an_older_timestamp() {
        let store = Arc::new(MemoryStore::new());
        let (alpha, _beta) = pair(&store, Arc::default()).await;
        let origin = Some(alpha.registry.server_id().clone());

        let mut fresh = ActorState::new_default(ActorId::new());
        fresh.origin_server = origin.clone();
        fresh.last_updated = Utc::now();
        store.save_actor(&fresh).await.unwrap();
        assert_eq!(alpha.reconciler.push_deltas().await.unwrap().actors, 1);

        let mut delayed = ActorState::new_default(ActorId::new());
        delayed.origin_server = origin;
        delayed.last_updated = fresh.last_updated - ChronoDuration::hours(1);
        store.save_actor(&delayed).await.unwrap();
        assert_eq!(alpha.reconciler.push_deltas().await.unwrap().actors, 1);
        assert_eq!(alpha.reconciler.push_deltas().await.unwrap().actors, 0);
    }

    #[tokio::test]
    async fn peer_serves_the_remote_actor_change_after_reconcile() {
        let store = Arc::new(MemoryStore::new());
        let (alpha, beta) = pair(&store, Arc::default()).await;
        let id = ActorId::new();

        let mut actor = ActorState::new_default(id);
        actor.favor = 10;
        alpha.state.save_actor(actor.clone()).wait().await.unwrap();
        alpha.reconciler.push_deltas().await.unwrap();
        beta.reconciler.reconcile_once().await.unwrap();
        assert_eq!(beta.state.load_actor(id).await.favor, 10);

        actor.favor = 75;
        alpha.state.save_actor(actor).wait().await.unwrap();
        alpha.reconciler.push_deltas().await.unwrap();
        let report = beta.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(beta.state.load_actor(id).await.favor, 75);
    }

    #[tokio::test]
    async fn remote_completion_reaches_the_sink_once() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(CountingSink::default());
        let (alpha, beta) = pair(&store, Arc::clone(&sink)).await;

        let done = completion(Utc::now());
        alpha.state.record_activity(done.clone()).wait().await.unwrap();
        alpha.reconciler.push_deltas().await.unwrap();
        beta.reconciler.reconcile_once().await.unwrap();
        assert_eq!(sink.completions.load(Ordering::SeqCst), 1);

        let mut resent = done;
        resent.origin_server = Some(alpha.registry.server_id().clone());
        alpha
            .bus
            .send(beta.registry.server_id(), &SyncPayload::ActivityCompleted(Box::new(resent)))
            .await
            .unwrap();
        beta.reconciler.reconcile_once().await.unwrap();
        assert_eq!(sink.completions.load(Ordering::SeqCst), 1);
    }
}
