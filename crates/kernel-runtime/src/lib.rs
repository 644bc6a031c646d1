//! Kernel Runtime - lifecycle management for an out-of-process kernel client.
//!
//! The kernel is a separate process doing the real work; this crate makes
//! sure a program talks to at most one of them at a time:
//!
//! - **Lifecycle** - lazy, exactly-once construction of the shared client,
//!   explicit release, and transparent re-creation afterwards
//! - **Kernel** - the collaborator traits a client implementation plugs into
//! - **Process** - a kernel started as a child process speaking over stdio
//! - **Config** - TOML file and environment configuration for the process kernel
//! - **Global** - a process-wide instance for code without an explicit context
//!
//! # Architecture
//!
//! [`Lifecycle`] is an ordinary value: construct one with any
//! [`KernelFactory`] and share it by reference. [`acquire`](Lifecycle::acquire)
//! hands out [`KernelHandle`]s to the live client; [`release`](Lifecycle::release)
//! closes it. Construction failures are returned to every caller that waited
//! on the failed attempt and leave the controller ready to retry.

pub mod config;
pub mod error;
pub mod global;
pub mod handle;
pub mod kernel;
pub mod lifecycle;
pub mod process;

pub use config::KernelConfig;
pub use error::{Error, LifecycleError, Result};
pub use handle::KernelHandle;
pub use kernel::{CloseToken, KernelClient, KernelFactory};
pub use lifecycle::{Lifecycle, ReleaseGuard};
pub use process::{ProcessClient, ProcessKernel};
