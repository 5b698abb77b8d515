//! Signal module — one-shot readiness latch used for acquisition and load notifications.

use parking_lot::{Condvar, Mutex};

/// Fires at most once; waiters block until it does.
///
/// Pulsed-ness is monotonic and can be queried without waiting, which is what
/// the queue pulsing logic in [`crate::current_page`] relies on.
pub struct Signal {
    pulsed: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    /// Creates a new, not yet pulsed [`Signal`].
    pub(crate) fn new() -> Signal {
        Signal {
            pulsed: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Fires the signal and wakes all waiters. Pulsing twice is a usage error.
    pub(crate) fn pulse(&self) {
        let mut pulsed = self.pulsed.lock();
        assert!(!*pulsed, "one-shot signal pulsed twice");
        *pulsed = true;
        self.cond.notify_all();
    }

    /// Fires the signal unless it already fired.
    pub(crate) fn pulse_if_not_pulsed(&self) {
        let mut pulsed = self.pulsed.lock();
        if !*pulsed {
            *pulsed = true;
            self.cond.notify_all();
        }
    }

    /// Returns true once the signal has fired.
    pub fn is_pulsed(&self) -> bool {
        *self.pulsed.lock()
    }

    /// Blocks the caller until the signal fires. Returns immediately if it
    /// already fired.
    pub fn wait(&self) {
        let mut pulsed = self.pulsed.lock();
        while !*pulsed {
            self.cond.wait(&mut pulsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn signal_starts_unpulsed() {
        let signal = Signal::new();
        assert!(!signal.is_pulsed());
    }

    #[test]
    fn wait_returns_after_pulse() {
        let signal = Arc::new(Signal::new());

        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || {
                signal.wait();
                assert!(signal.is_pulsed());
            })
        };

        // Give the waiter a chance to actually block first.
        thread::sleep(Duration::from_millis(50));
        signal.pulse();
        waiter.join().unwrap();
    }

    #[test]
    fn wait_after_pulse_is_immediate() {
        let signal = Signal::new();
        signal.pulse();
        signal.wait();
    }

    #[test]
    fn pulse_if_not_pulsed_is_idempotent() {
        let signal = Signal::new();
        signal.pulse_if_not_pulsed();
        signal.pulse_if_not_pulsed();
        assert!(signal.is_pulsed());
    }

    #[test]
    #[should_panic(expected = "pulsed twice")]
    fn double_pulse_panics() {
        let signal = Signal::new();
        signal.pulse();
        signal.pulse();
    }
}
