//! Error types for the runtime subsystems.

use std::io;
use thiserror::Error;

/// Errors surfaced by the message bus (service table, mailboxes).
#[derive(Debug, Error)]
pub enum BusError {
    /// The handle does not name a live service (stale generation or free slot).
    #[error("handle {0:#010x} does not name a live service")]
    StaleHandle(u32),

    /// The target service is being retired; the message was not delivered.
    #[error("service {0:#010x} is dying")]
    ServiceDying(u32),

    /// All service slots are occupied.
    #[error("service table is full (max: {max})")]
    TableFull {
        /// The configured slot count.
        max: usize,
    },
}

impl BusError {
    /// Returns `true` if retrying against the same handle can ever succeed.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::StaleHandle(_) | Self::ServiceDying(_))
    }
}

/// Errors from the dynamic module registry.
#[derive(Debug, Error)]
pub enum ModuleError {
    /// No path template candidate could be opened.
    #[error("module `{name}` not found (tried {tried} path candidates)")]
    NotFound {
        /// The requested module name.
        name: String,
        /// How many substituted paths were attempted.
        tried: usize,
    },

    /// The library loaded but does not export `{name}_init`.
    #[error("module `{0}` has no init entry point")]
    InitMissing(String),

    /// The module's init entry point returned failure.
    #[error("module `{0}` rejected initialization")]
    InitRejected(String),

    /// The registry table is full.
    #[error("module table is full (max: {max})")]
    TableFull {
        /// The fixed table capacity.
        max: usize,
    },
}

/// Errors from the socket server.
#[derive(Debug, Error)]
pub enum SocketError {
    /// All `2^16` socket ids are in use.
    #[error("socket id space exhausted")]
    IdExhausted,

    /// Writing a request to the reactor's control pipe failed.
    #[error("control pipe write failed: {0}")]
    PipeWrite(#[source] io::Error),

    /// A socket syscall failed with a non-retryable errno.
    #[error("{op} failed: {source}")]
    Syscall {
        /// The syscall that failed.
        op: &'static str,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A request referenced a slot in an unexpected state.
    #[error("request for socket {id} in invalid state")]
    BadRequest {
        /// The offending socket id.
        id: i32,
    },
}

impl SocketError {
    /// Shorthand for wrapping the current `errno` of a failed syscall.
    pub(crate) fn last_os(op: &'static str) -> Self {
        Self::Syscall {
            op,
            source: io::Error::last_os_error(),
        }
    }
}
