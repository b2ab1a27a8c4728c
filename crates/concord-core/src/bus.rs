//! Cross-server message bus and payload dispatch.
//!
//! [`MessageBus`] writes outbox rows: `send` addresses one server,
//! `broadcast` writes one row per peer known at call time (no wildcard
//! row, so peers that join later never see it).
//!
//! [`Dispatcher`] is the inbound side. It matches every [`SyncPayload`]
//! variant explicitly: state variants go to the [`StateApplier`], which
//! applies the idempotent merge rules to the store and to this process's
//! [`StateCache`], and gameplay variants go to the host's
//! [`NotificationSink`].
//!
//! Servers usually share one database, so the peer's write is often already
//! stored when its delta arrives. A delta counts as applied when either the
//! store or the cache changed. A remote completion reaches the sink once per
//! process whether or not the insert found the row already present.

use std::sync::Arc;

use async_trait::async_trait;
use concord_db::{MessageStore, NewMessage, StateRepository};
use concord_types::{
    ActivityCompletion, ActorState, GuildRecord, MessageId, RaidInvitation, ServerId,
    ServerNotice, SyncPayload,
};

use crate::cache::StateCache;
use crate::error::CoreError;
use crate::merge::{actor_supersedes, merge_guild};
use crate::registry::ServerRegistry;

// =============================================================================
// Outbound
// =============================================================================

/// Writes messages addressed to peer servers.
pub struct MessageBus {
    registry: Arc<ServerRegistry>,
    messages: Arc<dyn MessageStore>,
}

impl MessageBus {
    /// Create a bus sending as the registry's server.
    pub fn new(registry: Arc<ServerRegistry>, messages: Arc<dyn MessageStore>) -> Self {
        Self { registry, messages }
    }

    fn outbound(&self, target: &ServerId, payload: &SyncPayload) -> Result<NewMessage, CoreError> {
        Ok(NewMessage {
            from_server: self.registry.server_id().clone(),
            to_server: target.clone(),
            kind: payload.kind(),
            logical_key: payload.logical_key(),
            payload: payload.encode_body()?,
        })
    }

    /// Send one message to `target`.
    pub async fn send(&self, target: &ServerId, payload: &SyncPayload) -> Result<MessageId, CoreError> {
        let message = self.outbound(target, payload)?;
        let ids = self.messages.enqueue(std::slice::from_ref(&message)).await?;
        let id = ids.into_iter().next().ok_or_else(|| {
            CoreError::Store(concord_db::DbError::Unavailable(
                "message not persisted".to_owned(),
            ))
        })?;
        tracing::debug!(to = %target, kind = %payload.kind(), message_id = %id, "Sent sync message");
        Ok(id)
    }

    /// Send `payload` to every cached peer. Returns one id per peer; no
    /// peers means no rows.
    pub async fn broadcast(&self, payload: &SyncPayload) -> Result<Vec<MessageId>, CoreError> {
        self.broadcast_all(std::slice::from_ref(payload)).await
    }

    /// Send every payload to every cached peer in one batch insert.
    pub async fn broadcast_all(&self, payloads: &[SyncPayload]) -> Result<Vec<MessageId>, CoreError> {
        let peers = self.registry.peer_ids();
        if peers.is_empty() || payloads.is_empty() {
            return Ok(Vec::new());
        }

        let mut outbox = Vec::with_capacity(peers.len().saturating_mul(payloads.len()));
        for payload in payloads {
            for peer in &peers {
                outbox.push(self.outbound(peer, payload)?);
            }
        }
        let ids = self.messages.enqueue(&outbox).await?;
        tracing::debug!(
            peers = peers.len(),
            payloads = payloads.len(),
            rows = ids.len(),
            "Broadcast sync messages"
        );
        Ok(ids)
    }

    /// Number of peers a broadcast would currently reach.
    pub fn peer_count(&self) -> usize {
        self.registry.peer_ids().len()
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("server_id", self.registry.server_id())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Inbound
// =============================================================================

/// Result of applying one payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Local state changed or the sink was notified.
    Applied,
    /// Local state already reflected the payload.
    Unchanged,
}

/// Host-side handlers for payloads that are not stored state.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Players on this server were invited to a raid hosted elsewhere.
    async fn on_raid_invitation(
        &self,
        from: &ServerId,
        invitation: &RaidInvitation,
    ) -> Result<(), CoreError>;

    /// Another server issued a notice.
    async fn on_server_notice(&self, from: &ServerId, notice: &ServerNotice)
    -> Result<(), CoreError>;

    /// A completion recorded elsewhere reached this server for the first time.
    async fn on_activity_completed(&self, _activity: &ActivityCompletion) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Sink that only logs; used when the host registers none.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSink;

#[async_trait]
impl NotificationSink for LoggingSink {
    async fn on_raid_invitation(
        &self,
        from: &ServerId,
        invitation: &RaidInvitation,
    ) -> Result<(), CoreError> {
        tracing::info!(
            from = %from,
            activity = %invitation.activity_id,
            invitees = invitation.invitees.len(),
            "Raid invitation received"
        );
        Ok(())
    }

    async fn on_server_notice(&self, from: &ServerId, notice: &ServerNotice) -> Result<(), CoreError> {
        tracing::info!(from = %from, text = %notice.text, "Server notice received");
        Ok(())
    }
}

/// Applies received state with the merge rules.
pub struct StateApplier {
    state: Arc<dyn StateRepository>,
    cache: Arc<StateCache>,
}

fn outcome(changed: bool) -> ApplyOutcome {
    if changed {
        ApplyOutcome::Applied
    } else {
        ApplyOutcome::Unchanged
    }
}

impl StateApplier {
    /// Create an applier over the state repository and the cache the
    /// local [`StateService`](crate::state::StateService) reads through.
    pub fn new(state: Arc<dyn StateRepository>, cache: Arc<StateCache>) -> Self {
        Self { state, cache }
    }

    /// The cache deltas refresh.
    pub fn cache(&self) -> &StateCache {
        &self.cache
    }

    /// Write `actor` if it is newer than the stored record, and replace a
    /// cached copy it supersedes.
    ///
    /// The stored row is checked first so stale updates cost no write; the
    /// conditional upsert still guards against a concurrent writer.
    pub async fn apply_actor(&self, actor: &ActorState) -> Result<ApplyOutcome, CoreError> {
        let refreshed = self.cache.refresh_actor(actor);
        let current = self.state.load_actor(actor.actor_id).await?;
        let stored = actor_supersedes(current.as_ref(), actor)
            && self.state.apply_actor_if_newer(actor).await?;
        Ok(outcome(refreshed || stored))
    }

    /// Merge `incoming` into the stored guild and into a cached copy.
    pub async fn apply_guild(&self, incoming: &GuildRecord) -> Result<ApplyOutcome, CoreError> {
        let refreshed = self.cache.refresh_guild(incoming);
        let current = self.state.load_guild(incoming.guild_id).await?;
        let stored = match merge_guild(current.as_ref(), incoming) {
            Some(merged) => {
                self.state.upsert_guild(&merged).await?;
                true
            }
            None => false,
        };
        Ok(outcome(refreshed || stored))
    }

    /// Record `activity` unless its id is already present.
    pub async fn apply_activity(
        &self,
        activity: &ActivityCompletion,
    ) -> Result<ApplyOutcome, CoreError> {
        Ok(if self.state.record_activity(activity).await? {
            ApplyOutcome::Applied
        } else {
            ApplyOutcome::Unchanged
        })
    }
}

impl std::fmt::Debug for StateApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateApplier").finish_non_exhaustive()
    }
}

/// Routes each payload variant to its handler.
pub struct Dispatcher {
    applier: StateApplier,
    sink: Arc<dyn NotificationSink>,
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(applier: StateApplier, sink: Arc<dyn NotificationSink>) -> Self {
        Self { applier, sink }
    }

    /// Handle one payload sent by `from`.
    pub async fn dispatch(
        &self,
        from: &ServerId,
        payload: &SyncPayload,
    ) -> Result<ApplyOutcome, CoreError> {
        match payload {
            SyncPayload::ActorUpdate(actor) => self.applier.apply_actor(actor).await,
            SyncPayload::GuildUpdate(guild) => self.applier.apply_guild(guild).await,
            SyncPayload::ActivityCompleted(activity) => {
                let stored = self.applier.apply_activity(activity).await?;
                let cache = self.applier.cache();
                if cache.was_announced(activity.id) {
                    return Ok(stored);
                }
                self.sink.on_activity_completed(activity).await?;
                cache.mark_announced(activity.id);
                Ok(ApplyOutcome::Applied)
            }
            SyncPayload::RaidInvitation(invitation) => {
                self.sink.on_raid_invitation(from, invitation).await?;
                Ok(ApplyOutcome::Applied)
            }
            SyncPayload::ServerNotice(notice) => {
                self.sink.on_server_notice(from, notice).await?;
                Ok(ApplyOutcome::Applied)
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}
