//! Shared handles to the live kernel client.
//!
//! A handle only reads the client. Closing it is reserved for the owning
//! [`Lifecycle`](crate::Lifecycle) (see [`CloseToken`](crate::CloseToken)).

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Shared handle to the kernel client of one generation.
///
/// Cloning a handle is cheap. Handles are **not** recalled by
/// [`Lifecycle::release`](crate::Lifecycle::release): a handle captured before
/// a release keeps pointing at the closed client of its own generation, and
/// calls made through it fail the way the client reports them.
pub struct KernelHandle<C> {
    client: Arc<C>,
    generation: u64,
}

impl<C> KernelHandle<C> {
    pub(crate) fn new(client: Arc<C>, generation: u64) -> Self {
        Self { client, generation }
    }

    /// Returns a reference to the underlying client.
    #[inline]
    pub fn client(&self) -> &C {
        &self.client
    }

    /// The generation that produced this client, starting at 1.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True if both handles refer to the same client instance.
    pub fn same_client(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.client, &other.client)
    }
}

impl<C> Clone for KernelHandle<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            generation: self.generation,
        }
    }
}

impl<C> Deref for KernelHandle<C> {
    type Target = C;

    #[inline]
    fn deref(&self) -> &C {
        &self.client
    }
}

impl<C> fmt::Debug for KernelHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelHandle")
            .field("generation", &self.generation)
            .field("client", &Arc::as_ptr(&self.client))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_client() {
        let a = KernelHandle::new(Arc::new(7u32), 3);
        let b = a.clone();
        assert!(a.same_client(&b));
        assert_eq!(b.generation(), 3);
        assert_eq!(*b, 7);
    }

    #[test]
    fn test_equal_values_are_not_same_client() {
        let a = KernelHandle::new(Arc::new(7u32), 1);
        let b = KernelHandle::new(Arc::new(7u32), 1);
        assert!(!a.same_client(&b));
    }
}
