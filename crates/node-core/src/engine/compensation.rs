//! Compensating-closure stack: each step of a transactional operation
//! pushes an undo action as it succeeds; on error or cancellation the
//! stack unwinds in reverse. No exception machinery is required.

use futures::future::BoxFuture;

/// A stack of compensating actions recorded as a multi-step operation
/// makes progress. Actions are async (removing a directory, stopping a
/// container) so `unwind` is itself async; Rust has no `AsyncDrop`, so
/// unlike a sync stack this one is *not* auto-run on drop — every
/// fallible step in the orchestration engine explicitly calls `unwind`
/// before returning its error. Compensation itself is not cancellable,
/// so it always runs to completion once started.
pub struct CompensationStack {
    actions: Vec<BoxFuture<'static, ()>>,
}

impl CompensationStack {
    pub fn new() -> Self {
        Self { actions: Vec::new() }
    }

    /// Record an undo action for a step that just succeeded. The future
    /// is constructed (capturing whatever state it needs) but not polled
    /// until `unwind` runs it.
    pub fn push(&mut self, action: BoxFuture<'static, ()>) {
        self.actions.push(action);
    }

    /// Unwind every recorded action in reverse order, awaiting each to
    /// completion before starting the next.
    pub async fn unwind(mut self) {
        while let Some(action) = self.actions.pop() {
            action.await;
        }
    }

    /// Discard the stack without running its actions, once an operation
    /// has committed and no longer needs its undo path.
    pub fn commit(self) {
        drop(self);
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl Default for CompensationStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn unwind_runs_actions_in_reverse_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut stack = CompensationStack::new();
        for i in 0..3 {
            let order = order.clone();
            stack.push(Box::pin(async move {
                order.lock().unwrap().push(i);
            }));
        }
        stack.unwind().await;
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn commit_prevents_later_unwind() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut stack = CompensationStack::new();
        let ran_clone = ran.clone();
        stack.push(Box::pin(async move {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        }));
        stack.commit();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
