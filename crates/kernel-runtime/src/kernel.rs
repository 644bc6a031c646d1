//! Kernel collaborator traits.
//!
//! The lifecycle controller never talks to a kernel directly. It asks a
//! [`KernelFactory`] for a client and later hands that client back through
//! [`KernelClient::close`]. What happens in between (pipes, protocol,
//! marshalling) is the client's own business.

use crate::error::Result;

/// Abstracts kernel client creation.
///
/// Implementors define how a kernel is started and greeted. A factory is
/// owned by its [`Lifecycle`](crate::Lifecycle) and may be asked to
/// construct any number of clients over the process lifetime, one per
/// generation.
pub trait KernelFactory: Send + Sync {
    /// The client type shared among callers.
    type Client: KernelClient;

    /// Start (or attach to) a kernel and complete the handshake.
    ///
    /// Must either return a fully usable client or an error; a partially
    /// started kernel has to be cleaned up before returning the error.
    fn construct(&self) -> Result<Self::Client>;
}

/// Proof that the caller owns the client's lifecycle.
///
/// Only [`Lifecycle`](crate::Lifecycle) can create one, so code holding a
/// [`KernelHandle`](crate::KernelHandle) cannot close the shared client behind
/// the controller's back:
///
/// ```compile_fail
/// use kernel_runtime::CloseToken;
///
/// let token = CloseToken { _private: () };
/// ```
#[derive(Debug)]
pub struct CloseToken {
    _private: (),
}

impl CloseToken {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

/// A live connection to a kernel.
///
/// Clients are shared behind an `Arc`, so closing takes `&self`. Whether a
/// second `close` is a no-op or an error is up to the implementor.
pub trait KernelClient: Send + Sync + 'static {
    /// Terminate the kernel connection and release its resources.
    ///
    /// Called by the owning [`Lifecycle`](crate::Lifecycle) only; the
    /// [`CloseToken`] cannot be built anywhere else.
    fn close(&self, token: CloseToken) -> Result<()>;
}

impl<F, C> KernelFactory for F
where
    F: Fn() -> Result<C> + Send + Sync,
    C: KernelClient,
{
    type Client = C;

    fn construct(&self) -> Result<C> {
        self()
    }
}
