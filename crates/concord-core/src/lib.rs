//! Cross-server sync services for Concord.
//!
//! This crate turns the data layer into a running node: it keeps the
//! server registry fresh, moves messages between servers, applies what
//! peers send with deterministic merge rules, and pushes local changes out.
//!
//! # Modules
//!
//! - [`config`] -- Configuration loading from `concord.yaml` into
//!   strongly-typed structs.
//! - [`clock`] -- Per-process monotonic write clock.
//! - [`merge`] -- Merge rules for actor and guild records.
//! - [`registry`] -- Heartbeat, discovery, and stale-server sweep.
//! - [`bus`] -- Outbound messaging and inbound dispatch.
//! - [`reconciler`] -- Inbound passes with leases, supersession, retries;
//!   delta push with checkpoints.
//! - [`state`] -- Gameplay-facing async state access.
//! - [`scheduler`] -- Periodic background jobs.
//! - [`service`] -- [`SyncService`], startup and shutdown sequencing.
//!
//! [`SyncService`]: service::SyncService

pub mod bus;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod merge;
pub mod reconciler;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod state;

pub use error::CoreError;
