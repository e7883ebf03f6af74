//! Transaction coordinator for tessera block stores.
//!
//! One dispatcher process serializes the single writer and admits readers
//! against global space and time budgets. The writer works on shadow copies
//! of the controlled index files; readers only ever open the main files,
//! which change only when a commit promotes the shadows.
//!
//! # Components
//!
//! - [`governor`]: reader admission, per-token rate limits, penalty windows
//! - [`coordinator`]: the command state machine, shadow files and status dump
//! - [`ipc`]: the 32-bit word protocol and the shared-memory discovery segment
//! - [`server`]: the event loop that owns the coordinator
//! - [`client`]: the blocking client used by reader and writer processes
//!
//! # Example
//!
//! ```no_run
//! use tessera_dispatch::client::DispatcherClient;
//! use tessera_dispatch::config::RetryPolicy;
//!
//! # fn main() -> tessera_dispatch::Result<()> {
//! let mut client = DispatcherClient::discover("/tessera_dispatcher")?;
//! client.request_read_and_idx(30, 64 << 20, 0, &RetryPolicy::admission())?;
//! // ... load the indexes ...
//! client.read_idx_finished()?;
//! // ... read data ...
//! client.read_finished()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod client;
pub mod config;
pub mod coordinator;
pub mod governor;
pub mod ipc;
pub mod server;

pub use config::{DispatcherConfig, GovernorLimits, RetryPolicy};
pub use coordinator::Coordinator;
pub use governor::{Admission, ResourceGovernor};
pub use server::DispatchServer;

/// Result type for dispatcher operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors raised by the dispatcher and its clients.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A file or socket call failed.
    #[error("{origin}: I/O error on {}: {source}", path.display())]
    Io {
        /// Call site that issued the failing call.
        origin: &'static str,
        /// File or socket the call operated on.
        path: PathBuf,
        /// Underlying error, including the OS error number.
        #[source]
        source: std::io::Error,
    },

    /// Block store error.
    #[error("Storage error: {0}")]
    Storage(#[from] tessera_blocks::StoreError),

    /// Shared memory segment could not be created, mapped or parsed.
    #[error("Shared memory error: {0}")]
    SharedMemory(String),

    /// The peer sent something the protocol does not allow.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The write lock belongs to another process.
    #[error("Write lock held by process {pid}")]
    LockHeld {
        /// Process that owns the lock.
        pid: u32,
    },

    /// The client token is over its rate limit.
    #[error("Client token {token} is rate limited")]
    RateLimited {
        /// Rate-limited token.
        token: u32,
    },

    /// The request can never be admitted.
    #[error("Query rejected after {attempts} attempts")]
    Rejected {
        /// Attempts made.
        attempts: u32,
    },

    /// Promotion failed. The transaction is still open and the commit may
    /// be sent again.
    #[error("Commit failed on the dispatcher, transaction kept open")]
    CommitFailed,

    /// The dispatcher did not grant the request in time.
    #[error("No answer granted after {attempts} attempts")]
    Timeout {
        /// Attempts made.
        attempts: u32,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl DispatchError {
    /// Build a mapper that tags an `std::io::Error` with call site and file.
    pub fn io(origin: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| Self::Io {
            origin,
            path,
            source,
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Missing required configuration value
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    /// A value is out of range or malformed
    #[error("Invalid {field}: {reason}")]
    InvalidValue {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

/// Version information for the dispatcher.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
