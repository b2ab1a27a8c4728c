//! Shared type definitions for the Concord persistence and sync core.
//!
//! Every crate in the workspace speaks in these types: the data layer maps
//! them to rows, the sync core ships them between servers, and the legacy
//! tool converts file records into them.
//!
//! # Modules
//!
//! - [`ids`] -- Typed identifiers (UUID newtypes plus the process-scoped [`ServerId`])
//! - [`records`] -- Durable records: actors, guilds, activity completions, servers, migrations
//! - [`sync`] -- Cross-server message payloads and inbox rows

pub mod ids;
pub mod records;
pub mod sync;

pub use ids::{ActorId, CompletionId, GuildId, MessageId, ServerId};
pub use records::{
    ActivityCompletion, ActivityTier, ActorState, GuildRecord, GuildStats, MigrationRecord,
    ServerRecord, ServerStatus,
};
pub use sync::{MessageKind, RaidInvitation, ServerNotice, SyncMessage, SyncPayload};
