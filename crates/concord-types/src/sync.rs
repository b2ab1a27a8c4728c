//! Cross-server message payloads and inbox rows.
//!
//! A [`SyncPayload`] is what one server tells another. On the wire it is
//! split in two: the [`MessageKind`] goes into the `message_type` column
//! and the variant's body is JSON text in the `payload` column. Keeping the
//! kind outside the body lets a server skip rows of kinds it does not know
//! without decoding them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{ActorId, MessageId, ServerId};
use crate::records::{ActivityCompletion, ActorState, GuildRecord};

/// Discriminant of a [`SyncPayload`], stored as `message_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// A newer version of an actor record.
    ActorUpdate,
    /// A newer version of a guild record.
    GuildUpdate,
    /// A completed activity.
    ActivityCompleted,
    /// Players on another server are invited to a raid.
    RaidInvitation,
    /// Operator or lifecycle notice from another server.
    ServerNotice,
}

impl MessageKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::ActorUpdate,
        Self::GuildUpdate,
        Self::ActivityCompleted,
        Self::RaidInvitation,
        Self::ServerNotice,
    ];

    /// Stored column value.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ActorUpdate => "ACTOR_UPDATE",
            Self::GuildUpdate => "GUILD_UPDATE",
            Self::ActivityCompleted => "ACTIVITY_COMPLETED",
            Self::RaidInvitation => "RAID_INVITATION",
            Self::ServerNotice => "SERVER_NOTICE",
        }
    }
}

impl core::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown message type: {s}"))
    }
}

/// Invitation for players on another server to join a raid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaidInvitation {
    /// Unique id of this invitation.
    pub invitation_id: Uuid,
    /// Activity the raid runs.
    pub activity_id: String,
    /// Player who organised the raid.
    pub party_leader: ActorId,
    /// Players being invited.
    pub invitees: Vec<ActorId>,
    /// Server hosting the raid instance.
    pub host_server: ServerId,
    /// Invitation is void after this instant.
    pub expires_at: DateTime<Utc>,
}

/// Free-form notice broadcast by a server (maintenance, restarts).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerNotice {
    /// Unique id of this notice.
    pub notice_id: Uuid,
    /// Text shown to operators or players.
    pub text: String,
    /// When the notice was issued.
    pub issued_at: DateTime<Utc>,
}

/// Everything one server can tell another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPayload {
    /// Apply a newer actor record.
    ActorUpdate(Box<ActorState>),
    /// Merge a guild record.
    GuildUpdate(Box<GuildRecord>),
    /// Record a completed activity.
    ActivityCompleted(Box<ActivityCompletion>),
    /// Deliver a raid invitation to local players.
    RaidInvitation(RaidInvitation),
    /// Surface a notice locally.
    ServerNotice(ServerNotice),
}

impl SyncPayload {
    /// The kind stored alongside the body.
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::ActorUpdate(_) => MessageKind::ActorUpdate,
            Self::GuildUpdate(_) => MessageKind::GuildUpdate,
            Self::ActivityCompleted(_) => MessageKind::ActivityCompleted,
            Self::RaidInvitation(_) => MessageKind::RaidInvitation,
            Self::ServerNotice(_) => MessageKind::ServerNotice,
        }
    }

    /// Key identifying the entity this payload is about.
    ///
    /// When several unapplied rows share a key only the newest one needs
    /// to take effect; older ones are superseded.
    pub fn logical_key(&self) -> String {
        match self {
            Self::ActorUpdate(actor) => format!("actor:{}", actor.actor_id),
            Self::GuildUpdate(guild) => format!("guild:{}", guild.guild_id),
            Self::ActivityCompleted(done) => format!("activity:{}", done.id),
            Self::RaidInvitation(invite) => format!("raid_invitation:{}", invite.invitation_id),
            Self::ServerNotice(notice) => format!("notice:{}", notice.notice_id),
        }
    }

    /// Encode the variant body as JSON text for the `payload` column.
    pub fn encode_body(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::ActorUpdate(actor) => serde_json::to_string(actor),
            Self::GuildUpdate(guild) => serde_json::to_string(guild),
            Self::ActivityCompleted(done) => serde_json::to_string(done),
            Self::RaidInvitation(invite) => serde_json::to_string(invite),
            Self::ServerNotice(notice) => serde_json::to_string(notice),
        }
    }

    /// Decode a body previously produced by [`SyncPayload::encode_body`].
    pub fn decode(kind: MessageKind, body: &str) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            MessageKind::ActorUpdate => Self::ActorUpdate(Box::new(serde_json::from_str(body)?)),
            MessageKind::GuildUpdate => Self::GuildUpdate(Box::new(serde_json::from_str(body)?)),
            MessageKind::ActivityCompleted => {
                Self::ActivityCompleted(Box::new(serde_json::from_str(body)?))
            }
            MessageKind::RaidInvitation => Self::RaidInvitation(serde_json::from_str(body)?),
            MessageKind::ServerNotice => Self::ServerNotice(serde_json::from_str(body)?),
        })
    }
}

/// One row of the cross-server inbox.
///
/// Append-only. `processed` flips from false to true exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMessage {
    /// Row id.
    pub id: MessageId,
    /// Sending server.
    pub from_server: ServerId,
    /// Addressed server.
    pub to_server: ServerId,
    /// Raw `message_type` column; see [`MessageKind`].
    pub message_type: String,
    /// Entity key used to collapse duplicates.
    pub logical_key: String,
    /// JSON body.
    pub payload: String,
    /// Insert time.
    pub created_at: DateTime<Utc>,
    /// Whether the addressed server has applied (or superseded) the row.
    pub processed: bool,
    /// Failed dispatch attempts so far.
    pub attempts: u32,
    /// Earliest time the row may be attempted again.
    pub next_attempt_at: DateTime<Utc>,
    /// Error text of the last failed attempt.
    pub last_error: Option<String>,
    /// Set once attempts are exhausted; the row is no longer scanned.
    pub dead_lettered: bool,
}

impl SyncMessage {
    /// Decode the row into a typed payload.
    ///
    /// Returns `Ok(None)` for a `message_type` this build does not know.
    pub fn decode(&self) -> Result<Option<SyncPayload>, serde_json::Error> {
        match self.message_type.parse::<MessageKind>() {
            Ok(kind) => SyncPayload::decode(kind, &self.payload).map(Some),
            Err(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::ActivityTier;
    use crate::{ActorId, CompletionId};

    fn completion() -> ActivityCompletion {
        let now = Utc::now();
        ActivityCompletion {
            id: CompletionId::new(),
            activity_id: "molten_core".to_owned(),
            participants: vec![ActorId::new(), ActorId::new()],
            started_at: now,
            ended_at: now,
            score: 1200,
            tier: ActivityTier::Heroic,
            success: true,
            flawless: true,
            origin_server: Some(ServerId::from_stored("alpha-1")),
        }
    }

    #[test]
    fn kind_strings_parse_back() {
        for kind in MessageKind::ALL {
            assert_eq!(kind.as_str().parse::<MessageKind>(), Ok(kind));
        }
        assert!("WORLD_EVENT".parse::<MessageKind>().is_err());
    }

    #[test]
    fn body_decodes_with_its_kind() {
        let payload = SyncPayload::ActivityCompleted(Box::new(completion()));
        let body = payload.encode_body().unwrap_or_default();
        let decoded = SyncPayload::decode(payload.kind(), &body);
        assert_eq!(decoded.ok(), Some(payload));
    }

    #[test]
    fn actor_updates_share_a_logical_key() {
        let mut actor = ActorState::new_default(ActorId::new());
        let first = SyncPayload::ActorUpdate(Box::new(actor.clone()));
        actor.death_count = 4;
        let second = SyncPayload::ActorUpdate(Box::new(actor));
        assert_eq!(first.logical_key(), second.logical_key());
    }

    #[test]
    fn unknown_message_type_decodes_to_none() {
        let now = Utc::now();
        let row = SyncMessage {
            id: MessageId(1),
            from_server: ServerId::from_stored("a"),
            to_server: ServerId::from_stored("b"),
            message_type: "WORLD_EVENT".to_owned(),
            logical_key: "world".to_owned(),
            payload: "{}".to_owned(),
            created_at: now,
            processed: false,
            attempts: 0,
            next_attempt_at: now,
            last_error: None,
            dead_lettered: false,
        };
        assert!(matches!(row.decode(), Ok(None)));
    }
}
