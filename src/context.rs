//! The parent context shared by queues, events and command buffers.

use std::sync::Arc;

use crate::object::ObjectMagic;
use crate::tracking;

/// Handle to a context.
///
/// Every object except platforms and devices is created within a context, and
/// objects can only be combined when their contexts match. Handles compare by
/// object identity.
#[derive(Clone)]
pub struct Context(Arc<ContextInner>);

pub(crate) struct ContextInner {}

impl Context {
    pub fn new() -> Context {
        let vm = tracking::vm_snapshot_kb();
        let inner = Arc::new(ContextInner {});
        tracking::track_new(
            Arc::as_ptr(&inner) as usize,
            ObjectMagic::Context,
            "context",
            vm,
        );
        Context(inner)
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::new()
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Context {}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Context")
            .field(&Arc::as_ptr(&self.0))
            .finish()
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        tracking::track_drop(self as *const ContextInner as usize, ObjectMagic::Context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_equality() {
        let a = Context::new();
        let b = Context::new();
        let a2 = a.clone();
        assert_eq!(a, a2);
        assert_ne!(a, b);
    }

    #[test]
    #[cfg(debug_assertions)]
    fn tracked_for_lifetime() {
        let ctx = Context::new();
        let key = Arc::as_ptr(&ctx.0) as usize;
        assert!(crate::tracking::contains(key));
        drop(ctx);
        assert!(!crate::tracking::contains(key));
    }
}
