//! Data layer for the Concord sync core (`PostgreSQL`).
//!
//! Every store access goes through one [`PoolManager`]. The schema is
//! applied by the [`Migrator`] before anything else touches the store, and
//! each table is reached only through a narrow store trait.
//!
//! # Architecture
//!
//! ```text
//! Gameplay / sync services
//!     |
//!     +-- StateRepository  (actor_state, guilds, activity_completions)
//!     +-- RegistryStore    (server_registry)
//!     +-- MessageStore     (cross_server_sync)
//!     +-- CheckpointStore  (sync_checkpoints)
//!             |
//!             +-- PoolManager --> PgPool
//!                     |
//!                     +-- BackgroundExecutor (bounded, timed background work)
//! ```
//!
//! # Modules
//!
//! - [`pool`] -- connection pool, bind values, degraded (disabled) mode
//! - [`executor`] -- bounded background task execution and completion handles
//! - [`migrator`] -- compiled schema migrations and the `migrations` ledger
//! - [`store`] -- store traits and the [`Stores`] bundle
//! - [`state_store`], [`registry_store`], [`sync_store`] -- `PostgreSQL` stores
//! - [`memory`] -- in-memory stores for tests and store-less runs
//! - [`codec`] -- column conversions
//! - [`error`] -- shared error type

pub mod codec;
pub mod error;
pub mod executor;
pub mod memory;
pub mod migrator;
pub mod pool;
pub mod registry_store;
pub mod state_store;
pub mod store;
pub mod sync_store;

// Re-export primary types for convenience.
pub use error::DbError;
pub use executor::{BackgroundExecutor, ExecutorConfig, Pending};
pub use memory::MemoryStore;
pub use migrator::{
    MIGRATIONS, Migration, MigrationReport, MigrationState, Migrator, SchemaTarget,
};
pub use pool::{PoolConfig, PoolManager, SqlValue, Statement};
pub use registry_store::PgRegistryStore;
pub use state_store::PgStateStore;
pub use store::{
    Changed, CheckpointStore, MessageStore, NewMessage, RegistryStore, StateRepository, Stores,
    SyncEntity,
};
pub use sync_store::PgSyncStore;
