//! Attempt lifecycle hooks.
//!
//! Hooks let callers observe attempt transitions (notifications, metrics)
//! without touching the tick itself: a panicking hook is caught and logged,
//! never allowed to alter attempt or task state.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{error, info, warn};

/// Identifiers handed to every hook invocation.
#[derive(Clone, Debug)]
pub struct AttemptContext {
    pub run_id: String,
    pub task_id: String,
    pub attempt_id: String,
    pub operator_key: Option<String>,
    pub attempt_index: u32,
}

/// Observer of attempt lifecycle events. All methods default to no-ops, so
/// implementations override only what they care about.
pub trait LifecycleHook: Send + Sync {
    /// After the attempt row is created, before `prepare`.
    fn on_create(&self, context: &AttemptContext) {
        let _ = context;
    }

    /// After `submit` succeeds.
    fn on_submit(&self, context: &AttemptContext, external_id: Option<&str>) {
        let _ = (context, external_id);
    }

    /// On the transition to COMPLETED.
    fn on_complete(&self, context: &AttemptContext) {
        let _ = context;
    }

    /// On dispatch failure or a polled FAILED status.
    fn on_fail(&self, context: &AttemptContext, error: &str) {
        let _ = (context, error);
    }
}

/// Chains hooks; each is fired in order and isolated from the others.
pub struct CompositeHook {
    hooks: Vec<Box<dyn LifecycleHook>>,
}

impl CompositeHook {
    pub fn new(hooks: Vec<Box<dyn LifecycleHook>>) -> Self {
        Self { hooks }
    }
}

impl LifecycleHook for CompositeHook {
    fn on_create(&self, context: &AttemptContext) {
        for hook in &self.hooks {
            fire(|| hook.on_create(context), "on_create");
        }
    }

    fn on_submit(&self, context: &AttemptContext, external_id: Option<&str>) {
        for hook in &self.hooks {
            fire(|| hook.on_submit(context, external_id), "on_submit");
        }
    }

    fn on_complete(&self, context: &AttemptContext) {
        for hook in &self.hooks {
            fire(|| hook.on_complete(context), "on_complete");
        }
    }

    fn on_fail(&self, context: &AttemptContext, error: &str) {
        for hook in &self.hooks {
            fire(|| hook.on_fail(context, error), "on_fail");
        }
    }
}

/// Built-in hook that logs lifecycle events.
#[derive(Default)]
pub struct LoggingHook;

impl LifecycleHook for LoggingHook {
    fn on_create(&self, context: &AttemptContext) {
        info!(
            attempt_id = %context.attempt_id,
            task_id = %context.task_id,
            attempt_index = context.attempt_index,
            "attempt created"
        );
    }

    fn on_submit(&self, context: &AttemptContext, external_id: Option<&str>) {
        info!(
            attempt_id = %context.attempt_id,
            task_id = %context.task_id,
            external_id = external_id.unwrap_or("-"),
            "attempt submitted"
        );
    }

    fn on_complete(&self, context: &AttemptContext) {
        info!(
            attempt_id = %context.attempt_id,
            task_id = %context.task_id,
            "attempt completed"
        );
    }

    fn on_fail(&self, context: &AttemptContext, error: &str) {
        error!(
            attempt_id = %context.attempt_id,
            task_id = %context.task_id,
            error = %error,
            "attempt failed"
        );
    }
}

fn fire<F: FnOnce()>(f: F, what: &str) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!(hook = %what, "lifecycle hook panicked; continuing");
    }
}

/// Fire a hook method, containing panics.
pub(crate) fn fire_safely<F: FnOnce()>(f: F, what: &str) {
    fire(f, what);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Panicking;
    impl LifecycleHook for Panicking {
        fn on_create(&self, _context: &AttemptContext) {
            panic!("hook bug");
        }
    }

    struct Counting(Arc<AtomicUsize>);
    impl LifecycleHook for Counting {
        fn on_create(&self, _context: &AttemptContext) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn composite_isolates_panicking_hooks() {
        let count = Arc::new(AtomicUsize::new(0));
        let composite = CompositeHook::new(vec![
            Box::new(Panicking),
            Box::new(Counting(count.clone())),
        ]);
        let context = AttemptContext {
            run_id: "r".into(),
            task_id: "t".into(),
            attempt_id: "a".into(),
            operator_key: None,
            attempt_index: 1,
        };
        composite.on_create(&context);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
