// Allow unused assignments for diagnostic fields - they're used by the thiserror/miette macros
#![allow(unused_assignments)]

pub mod api_client;
pub mod config;
pub mod error;
pub mod mock;
pub mod retry;
pub mod tasks;
pub mod templates;
pub mod traits;
pub mod volumes;

// Re-export primary types
pub use error::{ClusterError, Result};
pub use mock::{FaultKind, MockCluster, MockOp};
pub use traits::{ClusterStore, DeleteParams};

// Re-export client and lifecycle types
pub use api_client::ApiClient;
pub use config::ClusterConfig;
pub use retry::retry_on_conflict;
pub use tasks::{phase_of, TaskManager, TaskManagerConfig, TaskRef};
pub use templates::TaskImage;
