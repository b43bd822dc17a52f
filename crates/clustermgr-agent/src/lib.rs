#![warn(missing_docs)]

//! ClusterMgr agent subsystem: daemon-side perf counters and the report session to the active manager

pub mod auth;
pub mod client;
pub mod config;
pub mod counters;
pub mod error;
pub mod session;

pub use auth::Authorizer;
pub use client::{MgrClient, ReportStats, ReportStatsSnapshot};
pub use config::AgentConfig;
pub use counters::PerfCounters;
pub use error::{AgentError, Result};
pub use session::{ReportSession, SentReport, SessionParams, SessionState};
