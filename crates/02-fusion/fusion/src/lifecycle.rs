//! Ordered init / teardown bookkeeping for a world handle.

use tracing::debug;

type Teardown = Box<dyn FnOnce() + Send>;

/// Teardown closures recorded in the order their init steps succeeded.
#[derive(Default)]
pub struct Lifecycle {
    steps: Vec<(&'static str, Teardown)>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `name` completed; `teardown` undoes it.
    pub fn push(&mut self, name: &'static str, teardown: impl FnOnce() + Send + 'static) {
        debug!(step = name, "init step complete");
        self.steps.push((name, Box::new(teardown)));
    }

    /// Names of the completed steps, in init order.
    pub fn steps(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.steps.iter().map(|(name, _)| *name)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs every recorded teardown, newest first.
    pub fn unwind(&mut self) {
        while let Some((name, teardown)) = self.steps.pop() {
            debug!(step = name, "teardown");
            teardown();
        }
    }

    /// Drops the recorded teardowns without running them.
    pub fn forget(&mut self) {
        self.steps.clear();
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        self.unwind();
    }
}
