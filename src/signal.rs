use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cancellation token scoped to one build generation.
///
/// A signal starts out live and is flipped to aborted exactly once, when the
/// orchestrator supersedes the generation with a newer one. There is no way
/// back: collaborators and task closures only ever read the current state.
///
/// Checking the signal is advisory. Tasks consult it at defined checkpoints,
/// right after each asynchronous collaborator call and before applying its
/// result to the graph. Work already in flight is never interrupted, only
/// its result is discarded.
#[derive(Clone, Debug, Default)]
pub struct BuildSignal {
    aborted: Arc<AtomicBool>,
}

impl BuildSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the signal to aborted. Idempotent.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_live() {
        let signal = BuildSignal::new();
        assert!(!signal.is_aborted());
    }

    #[test]
    fn abort_is_one_way_and_idempotent() {
        let signal = BuildSignal::new();
        let clone = signal.clone();

        signal.abort();
        assert!(signal.is_aborted());
        assert!(clone.is_aborted());

        signal.abort();
        assert!(clone.is_aborted());
    }

    #[test]
    fn clones_share_state() {
        let signal = BuildSignal::new();
        let clone = signal.clone();

        clone.abort();
        assert!(signal.is_aborted());
    }
}
