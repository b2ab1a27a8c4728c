//! Type-safe identifier wrappers.
//!
//! Durable entities use UUID newtypes so an actor id can never be passed
//! where a guild id is expected. Servers are identified by a readable
//! string that embeds a per-process UUID v7, see [`ServerId::generate`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generates a newtype wrapper around [`Uuid`] with standard derives.
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new identifier using UUID v7 (time-ordered).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Return the inner [`Uuid`] value.
            pub const fn into_inner(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl core::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

define_id! {
    /// Stable external identity of a player actor.
    ActorId
}

define_id! {
    /// Unique identifier for a guild.
    GuildId
}

define_id! {
    /// Unique identifier for one activity completion event (a finished raid).
    CompletionId
}

/// Identifier of a game-server process.
///
/// Unique for the lifetime of one process instance: a restarted server
/// announces itself under a fresh id, so heartbeats of the previous
/// incarnation can never be mistaken for the new one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    /// Build a fresh id for this process from its advertised name.
    ///
    /// The format is `{name}-{uuid_v7}`.
    pub fn generate(name: &str) -> Self {
        Self(format!("{name}-{}", Uuid::now_v7()))
    }

    /// Wrap an id read back from storage.
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ServerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Row id of a message in the cross-server inbox table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl core::fmt::Display for MessageId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_server_ids_are_unique_per_call() {
        let a = ServerId::generate("lobby");
        let b = ServerId::generate("lobby");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("lobby-"));
    }

    #[test]
    fn actor_id_parses_from_string() {
        let id = ActorId::new();
        let parsed: Result<ActorId, _> = id.to_string().parse();
        assert_eq!(parsed.ok(), Some(id));
    }

    #[test]
    fn ids_serialize_transparently() {
        let id = GuildId::from(Uuid::nil());
        let json = serde_json::to_string(&id).unwrap_or_default();
        assert_eq!(json, "\"00000000-0000-0000-0000-000000000000\"");
    }
}
