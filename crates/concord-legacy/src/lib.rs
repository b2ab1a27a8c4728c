//! Legacy file store import and export for Concord.
//!
//! Before the relational store, every record lived in its own YAML file.
//! This crate reads that layout, moves it into the store through the
//! state repository, writes it back out on demand, and takes backups.
//!
//! # Modules
//!
//! - [`files`] -- Directory layout, document reads and atomic writes.
//! - [`format`] -- Legacy document types and their record conversions.
//! - [`backup`] -- Timestamped backups with an optional store dump.
//! - [`tool`] -- [`MigrationTool`]: migrate, export, backup, validate.
//! - [`error`] -- [`LegacyError`].
//!
//! [`MigrationTool`]: tool::MigrationTool
//! [`LegacyError`]: error::LegacyError

pub mod backup;
pub mod error;
pub mod files;
pub mod format;
pub mod tool;

pub use error::LegacyError;
pub use tool::{MigrationOutcome, MigrationTool};
