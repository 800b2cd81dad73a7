use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Pending,
    Running,
    Ready,
    Failed(String),
}

/// One-shot gate around a shared prefetch (e.g. downloading model weights once per host).
///
/// The first caller of [`PrefetchGate::run_or_wait`] runs the prefetch; every other caller
/// blocks until it finishes and then observes the same outcome. Clones share the gate, so hand
/// one to each worker thread.
#[derive(Debug, Clone)]
pub struct PrefetchGate {
    inner: Arc<(Mutex<State>, Condvar)>,
}

impl Default for PrefetchGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PrefetchGate {
    pub fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(State::Pending), Condvar::new())),
        }
    }

    /// Whether the prefetch has completed successfully.
    pub fn is_ready(&self) -> bool {
        *self.lock() == State::Ready
    }

    pub fn run_or_wait(&self, prefetch: impl FnOnce() -> Result<()>) -> Result<()> {
        let (_, cvar) = &*self.inner;
        let mut state = cvar
            .wait_while(self.lock(), |s| {
                if *s == State::Running {
                    debug!("waiting for prefetch leader");
                }
                *s == State::Running
            })
            .unwrap_or_else(PoisonError::into_inner);
        match &*state {
            State::Ready => return Ok(()),
            State::Failed(message) => {
                return Err(Error::Model(format!("prefetch failed: {message}")));
            }
            State::Pending | State::Running => {}
        }
        *state = State::Running;
        drop(state);

        info!("running prefetch");
        let mut finish = Finish {
            gate: self,
            outcome: State::Failed("prefetch leader panicked".to_owned()),
        };
        let result = prefetch();
        finish.outcome = match &result {
            Ok(()) => State::Ready,
            Err(err) => State::Failed(err.to_string()),
        };
        drop(finish);
        result
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Publishes the leader's outcome and wakes waiters, also when the prefetch unwinds.
struct Finish<'a> {
    gate: &'a PrefetchGate,
    outcome: State,
}

impl Drop for Finish<'_> {
    fn drop(&mut self) {
        *self.gate.lock() = std::mem::replace(&mut self.outcome, State::Pending);
        self.gate.inner.1.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn prefetch_runs_once_across_threads() {
        let gate = PrefetchGate::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                let runs = Arc::clone(&runs);
                thread::spawn(move || {
                    gate.run_or_wait(|| {
                        runs.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        Ok(())
                    })
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().expect("worker thread").is_ok());
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(gate.is_ready());
    }

    #[test]
    fn followers_observe_leader_failure() {
        let gate = PrefetchGate::new();
        let err = gate
            .run_or_wait(|| Err(Error::msg("disk full")))
            .unwrap_err();
        assert!(err.to_string().contains("disk full"));

        let mut ran = false;
        let err = gate
            .run_or_wait(|| {
                ran = true;
                Ok(())
            })
            .unwrap_err();
        assert!(!ran);
        assert!(matches!(err, Error::Model(_)));
        assert!(!gate.is_ready());
    }
}
