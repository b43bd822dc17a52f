#![warn(missing_docs)]

//! ClusterMgr subsystem: report aggregation, daemon metadata index, cluster map reconciliation

pub mod auth;
pub mod cluster_state;
pub mod command;
pub mod config;
pub mod config_keys;
pub mod error;
pub mod handle;
pub mod local;
pub mod metadata;
pub mod metrics;
pub mod mgr;
pub mod module;
pub mod notify;
pub mod perf;
pub mod server;
pub mod state;

pub use auth::{AuthHandler, AuthRegistry};
pub use cluster_state::{ClusterMapSnapshot, ClusterStateSync, SyncOutcome};
pub use command::{CommandResult, CommandRunner};
pub use config::{AuthConfig, MgrConfig};
pub use config_keys::ConfigKeyStore;
pub use error::{MgrError, Result};
pub use handle::MgrHandle;
pub use local::{ClusterDescription, LocalCluster, LocalDaemon};
pub use metadata::{DaemonMetadata, DaemonMetadataIndex};
pub use metrics::{ServerMetrics, ServerMetricsSnapshot};
pub use mgr::Mgr;
pub use module::{EventLogModule, MgrModule};
pub use notify::{DispatcherStats, NotifyDispatcher};
pub use perf::DaemonPerfCounters;
pub use server::{DaemonServer, DaemonSession};
