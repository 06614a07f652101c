/// Guard that runs a closure when dropped.
///
/// Cleanup that must also happen when a task panics or is cancelled goes in here.
pub struct DeferGuard<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for DeferGuard<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f()
        }
    }
}

/// Defers `f` until the returned [`DeferGuard`] is dropped.
pub fn defer<F: FnOnce()>(f: F) -> DeferGuard<F> {
    DeferGuard(Some(f))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn test_runs_on_drop() {
        let ran = Cell::new(false);
        {
            let _guard = defer(|| ran.set(true));
            assert!(!ran.get());
        }
        assert!(ran.get());
    }

    #[test]
    fn test_runs_on_panic() {
        let ran = AtomicBool::new(false);
        let result = std::panic::catch_unwind(|| {
            let _guard = defer(|| ran.store(true, Ordering::Relaxed));
            panic!("job failed");
        });
        assert!(result.is_err());
        assert!(ran.load(Ordering::Relaxed));
    }
}
