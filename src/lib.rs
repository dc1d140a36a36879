//! Alarm server - alarm state and automated-action engine
//!
//! Maintains a hierarchical tree of alarm PVs and groups. Each PV runs the
//! latching severity logic, groups show the worst severity below them, and
//! every change is replicated over a keyed message log so clients can rebuild
//! the tree. Items can carry delayed automated actions (email, commands)
//! that run when an alarm stays active long enough.
//!
//! # Feature Flags
//!
//! - `mqtt`: MQTT back-end for the message log (default)
//! - `email`: SMTP delivery for `mailto:` actions (default)
//!
//! Without either, the in-process [`broker::LocalLog`] and `cmd:` actions
//! remain available.
//!
//! # Examples
//!
//! ```rust,no_run
//! use alarm_server::{AlarmServer, ServerConfig, broker::LocalLog, server::default_handlers};
//! use std::sync::Arc;
//!
//! # async fn run() -> alarm_server::Result<()> {
//! let config = ServerConfig::from_file("alarm-server.yaml")?;
//! let handlers = default_handlers(&config);
//! let server = AlarmServer::new(config, Arc::new(LocalLog::new()), handlers)?;
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// CORE MODULES
// ============================================================================

/// Error type shared by all modules
pub mod error;

/// Alarm severities and their ordering
pub mod severity;

/// Severity snapshots of a PV
pub mod state;

/// Sliding window of recent alarms for count-based latching
pub mod history;

/// One-shot timer that can be pushed back
pub mod timer;

/// Alarm tree with latching PVs and aggregating groups
pub mod tree;

/// `$(NAME)` expansion for command actions
pub mod macros;

/// Configuration management with YAML support and validation
pub mod config;

// ============================================================================
// AUTOMATED ACTIONS
// ============================================================================

/// Delayed actions, flood suppression and the executor
pub mod actions;

// ============================================================================
// DISTRIBUTION
// ============================================================================

/// Keyed message log back-ends
pub mod broker;

/// Topics, keys and wire messages
pub mod protocol;

/// Client side tree rebuilt from the message log
pub mod client;

/// Permission checks for client commands
pub mod auth;

/// The alarm server
pub mod server;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use client::AlarmClientModel;
pub use config::ServerConfig;
pub use error::{AlarmError, Result};
pub use server::AlarmServer;
pub use severity::SeverityLevel;
pub use state::{AlarmState, PvState};
pub use tree::AlarmTree;

// ============================================================================
// VERSION INFORMATION
// ============================================================================

/// Crate version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
