use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Flags {
    stop: bool,
    abort: bool,
}

/// Cancellation token handed to every stream at spawn time
///
/// Two levels: a stop request is cooperative (the stream finishes its
/// current tick and exits at the top of its loop); an abort additionally
/// tells blocking work, such as a running diagnostic command, to give up.
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<(Mutex<Flags>, Condvar)>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// A signal that is already stopped, for exercising shutdown paths
    pub fn stopped() -> Self {
        let signal = Self::new();
        signal.request_stop();
        signal
    }

    fn flags(&self) -> MutexGuard<'_, Flags> {
        // Flags are plain booleans; a panic while holding the lock cannot corrupt them
        match self.inner.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn request_stop(&self) {
        self.flags().stop = true;
        self.inner.1.notify_all();
    }

    /// Request stop and cancel in-flight blocking work
    pub fn abort(&self) {
        {
            let mut flags = self.flags();
            flags.stop = true;
            flags.abort = true;
        }
        self.inner.1.notify_all();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.flags().stop
    }

    pub fn is_aborted(&self) -> bool {
        self.flags().abort
    }

    /// Sleep for `timeout` or until stop is requested
    ///
    /// Returns `true` if stop was requested. A timeout too large to add to
    /// the current instant waits for the stop request alone.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut flags = self.flags();
        loop {
            if flags.stop {
                return true;
            }
            flags = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    match self.inner.1.wait_timeout(flags, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
                None => match self.inner.1.wait(flags) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                },
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_new_signal_is_clear() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_stop_requested());
        assert!(!signal.is_aborted());
    }

    #[test]
    fn test_stopped_signal() {
        let signal = ShutdownSignal::stopped();
        assert!(signal.is_stop_requested());
        assert!(!signal.is_aborted());
        assert!(signal.wait_timeout(Duration::from_secs(10)));
    }

    #[test]
    fn test_abort_implies_stop() {
        let signal = ShutdownSignal::new();
        signal.abort();
        assert!(signal.is_stop_requested());
        assert!(signal.is_aborted());
    }

    #[test]
    fn test_wait_times_out_without_stop() {
        let signal = ShutdownSignal::new();
        let started = Instant::now();
        assert!(!signal.wait_timeout(Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_request_stop_wakes_waiter() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();
        let handle = thread::spawn(move || {
            let started = Instant::now();
            let stopped = waiter.wait_timeout(Duration::from_secs(30));
            (stopped, started.elapsed())
        });

        thread::sleep(Duration::from_millis(50));
        signal.request_stop();

        let (stopped, waited) = handle.join().unwrap();
        assert!(stopped);
        assert!(waited < Duration::from_secs(10));
    }

    #[test]
    fn test_unrepresentable_timeout_waits_for_stop() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();
        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs_f64(1e19)));

        thread::sleep(Duration::from_millis(50));
        signal.request_stop();

        assert!(handle.join().unwrap());
    }
}
