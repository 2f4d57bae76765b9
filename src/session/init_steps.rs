//! Initialization step gating
//!
//! Data-dependent continuations wait until every prerequisite step has
//! completed, whatever order the steps finish in. A continuation is taken
//! out of the queue before it runs, so it runs at most once.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

/// Steps that gate a session as ready
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InitializationStep {
    ClientInfo,
    Conversations,
    Receivers,
}

impl InitializationStep {
    /// Everything required before the startup future resolves
    pub const REQUIRED: [InitializationStep; 3] =
        [Self::ClientInfo, Self::Conversations, Self::Receivers];
}

impl fmt::Display for InitializationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientInfo => f.write_str("client info"),
            Self::Conversations => f.write_str("conversations"),
            Self::Receivers => f.write_str("receivers"),
        }
    }
}

type Routine = Box<dyn FnOnce() + Send>;

struct PendingRoutine {
    required: Vec<InitializationStep>,
    routine: Routine,
}

#[derive(Default)]
struct StepsInner {
    completed: HashSet<InitializationStep>,
    pending: Vec<PendingRoutine>,
}

#[derive(Default)]
pub struct InitializationSteps {
    inner: Mutex<StepsInner>,
}

impl InitializationSteps {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StepsInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark `step` complete and run every continuation that became ready.
    ///
    /// Completing a step twice is misuse; it is logged and ignored.
    pub fn register(&self, step: InitializationStep) {
        let ready = {
            let mut inner = self.lock();
            if !inner.completed.insert(step) {
                warn!(%step, "Initialization step already completed");
                return;
            }
            debug!(%step, "Initialization step completed");

            let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.pending)
                .into_iter()
                .partition(|p| p.required.iter().all(|s| inner.completed.contains(s)));
            inner.pending = waiting;
            ready
        };

        for pending in ready {
            (pending.routine)();
        }
    }

    /// Run `routine` once all of `required` are complete; immediately if they already are.
    pub fn run_after<F>(&self, required: &[InitializationStep], routine: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut inner = self.lock();
            if !required.iter().all(|s| inner.completed.contains(s)) {
                inner.pending.push(PendingRoutine {
                    required: required.to_vec(),
                    routine: Box::new(routine),
                });
                return;
            }
        }
        routine();
    }

    pub fn is_complete(&self, step: InitializationStep) -> bool {
        self.lock().completed.contains(&step)
    }

    pub fn pending_routines(&self) -> usize {
        self.lock().pending.len()
    }

    /// Forget completed steps and drop queued continuations
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.completed.clear();
        inner.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use InitializationStep::*;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_waits_for_all_prerequisites_in_any_order() {
        for order in [[ClientInfo, Receivers], [Receivers, ClientInfo]] {
            let steps = InitializationSteps::new();
            let (count, routine) = counter();
            steps.run_after(&[ClientInfo, Receivers], routine);

            steps.register(order[0]);
            assert_eq!(count.load(Ordering::SeqCst), 0);
            steps.register(order[1]);
            assert_eq!(count.load(Ordering::SeqCst), 1);

            steps.register(Conversations);
            assert_eq!(count.load(Ordering::SeqCst), 1);
            assert_eq!(steps.pending_routines(), 0);
        }
    }

    #[test]
    fn test_runs_immediately_when_already_complete() {
        let steps = InitializationSteps::new();
        steps.register(Receivers);
        let (count, routine) = counter();
        steps.run_after(&[Receivers], routine);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_registration_does_not_rerun() {
        let steps = InitializationSteps::new();
        let (count, routine) = counter();
        steps.run_after(&[ClientInfo], routine);
        steps.register(ClientInfo);
        steps.register(ClientInfo);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_routine_may_register_steps() {
        let steps = Arc::new(InitializationSteps::new());
        let (count, routine) = counter();
        steps.run_after(&[Receivers, Conversations], routine);

        let inner = steps.clone();
        steps.run_after(&[Receivers], move || inner.register(Conversations));
        steps.register(Receivers);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(steps.is_complete(Conversations));
    }

    #[test]
    fn test_reset_drops_queue() {
        let steps = InitializationSteps::new();
        let (count, routine) = counter();
        steps.run_after(&[ClientInfo], routine);
        steps.reset();
        steps.register(ClientInfo);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
