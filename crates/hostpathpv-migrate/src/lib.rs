//! Hostpathpv Migrate - moving, upgrading and resizing hostpath volumes
//!
//! This crate provides:
//! - Cross-node and same-node moves of quota directories
//! - Upgrade of legacy hostPath volumes to the CSI driver
//! - Quota path, disk and capacity maintenance commands
//! - Safety checks that refuse a move before anything changes
//! - Step progress reporting and compensating cleanup

// Allow unused assignments for diagnostic fields - they're used by the thiserror/miette macros
#![allow(unused_assignments)]

pub mod context;
pub mod cordon;
pub mod error;
pub mod inventory;
pub mod move_local;
pub mod move_remote;
pub mod options;
pub mod precheck;
pub mod progress;
pub mod upgrade;
pub mod volume_ops;

// Re-export commonly used types
pub use context::MigrationContext;
pub use error::{MigrateError, Result};
pub use inventory::Inventory;
pub use move_local::{move_within_node, LocalMove};
pub use move_remote::{move_across_nodes, CrossNodeMove, NodePaths};
pub use options::{MoveOptions, UpgradeOptions};
pub use precheck::Violation;
pub use progress::{Progress, ProgressEvent, Renderer};
pub use upgrade::{plan_upgrade, upgrade_volumes, UpgradePlan};
pub use volume_ops::{DeletePlan, DeleteSelector, ScaleOp, ScaleOutcome, ScaleReport};
