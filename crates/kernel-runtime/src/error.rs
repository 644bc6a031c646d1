//! Error types for kernel-runtime.

use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for kernel-runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the kernel collaborator and its configuration.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration file or environment override error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// JSON encoding/decoding error on the kernel pipes
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The kernel program could not be launched.
    #[error("Failed to start kernel '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The kernel started but did not complete the handshake.
    #[error("Kernel handshake failed: {0}")]
    Handshake(String),

    /// The kernel did not greet within the configured time.
    #[error("Timeout waiting for kernel handshake ({}ms)", .0.as_millis())]
    HandshakeTimeout(Duration),

    /// The kernel did not exit within the configured grace period and was killed.
    #[error("Kernel did not exit within {}ms and was killed", .0.as_millis())]
    ShutdownTimeout(Duration),

    /// The kernel process terminated unsuccessfully.
    #[error("Kernel exited with status: {0}")]
    KernelExited(ExitStatus),

    /// Opaque failure reported by a kernel collaborator.
    #[error("Kernel error: {0}")]
    Kernel(String),
}

/// Errors surfaced by [`Lifecycle`](crate::Lifecycle).
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The collaborator could not produce a client.
    ///
    /// Every caller that waited on the same initialization attempt receives
    /// the same underlying error.
    #[error("Kernel client construction failed: {0}")]
    Construction(#[source] Arc<Error>),

    /// The collaborator could not cleanly close the client.
    ///
    /// The controller has already been reset when this is returned.
    #[error("Kernel client close failed: {0}")]
    Closure(#[source] Error),
}

impl LifecycleError {
    /// The collaborator error behind this failure.
    pub fn kernel_error(&self) -> &Error {
        match self {
            LifecycleError::Construction(err) => err,
            LifecycleError::Closure(err) => err,
        }
    }
}
