//! At-most-once completion callbacks.
//!
//! Plugins receive a [`Callback`] for init completion and for bid completion.
//! They are free to clone it and call it as many times as they like; only the
//! first call runs the wrapped closure. The orchestrator uses the same guard
//! for the round-level "bids ready" transition.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

type Pending = Option<Box<dyn FnOnce()>>;

/// A cloneable callback whose closure runs at most once across all clones.
#[derive(Clone)]
pub struct Callback {
    pending: Rc<RefCell<Pending>>,
}

impl Callback {
    /// Wrap `f` so that it runs on the first [`Callback::call`] only.
    pub fn new(f: impl FnOnce() + 'static) -> Self {
        Self {
            pending: Rc::new(RefCell::new(Some(Box::new(f)))),
        }
    }

    /// A callback that does nothing when called.
    #[must_use]
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    /// Run the wrapped closure if no clone has run it yet.
    ///
    /// The closure is taken out before it runs, so a re-entrant call from
    /// inside the closure is a no-op.
    pub fn call(&self) {
        let pending = self.pending.borrow_mut().take();
        if let Some(f) = pending {
            f();
        }
    }

    /// True once any clone has been called.
    #[must_use]
    pub fn is_called(&self) -> bool {
        self.pending.borrow().is_none()
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("called", &self.is_called())
            .finish()
    }
}
