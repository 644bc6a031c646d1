//! Process-wide kernel client.
//!
//! A lazily configured [`Lifecycle`] shared by the whole process. Prefer
//! passing an explicit [`Lifecycle`] around where that is practical; this
//! module exists for call sites that have no context to thread it through.
//!
//! Using the client after [`release`] silently starts a new kernel, which must
//! then be released again. This is mostly useful in tests.

use crate::config::KernelConfig;
use crate::error::LifecycleError;
use crate::handle::KernelHandle;
use crate::lifecycle::{Lifecycle, ReleaseGuard};
use crate::process::{ProcessClient, ProcessKernel};
use std::sync::LazyLock;

/// Configuration is read on first touch, from the config file and environment.
static RUNTIME: LazyLock<Lifecycle<ProcessKernel>> =
    LazyLock::new(|| Lifecycle::new(ProcessKernel::new(KernelConfig::load_or_default())));

/// The process-wide controller.
pub fn lifecycle() -> &'static Lifecycle<ProcessKernel> {
    &RUNTIME
}

/// Get the process-wide kernel client, starting the kernel if needed.
pub fn acquire() -> Result<KernelHandle<ProcessClient>, LifecycleError> {
    RUNTIME.acquire()
}

/// Stop the process-wide kernel, if one is running.
pub fn release() -> Result<(), LifecycleError> {
    RUNTIME.release()
}

/// True if the process-wide kernel is running.
pub fn is_ready() -> bool {
    RUNTIME.is_ready()
}

/// Stop the process-wide kernel when the returned guard is dropped.
///
/// ```ignore
/// fn main() -> anyhow::Result<()> {
///     let _kernel = kernel_runtime::global::release_guard();
///     let client = kernel_runtime::global::acquire()?;
///     // ...
///     Ok(())
/// }
/// ```
pub fn release_guard() -> ReleaseGuard<'static, ProcessKernel> {
    RUNTIME.release_on_drop()
}
