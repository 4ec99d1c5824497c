//! Cancellable periodic worker.
//!
//! A [`Ticker`] owns one named OS thread that runs a closure every `period`
//! (first run one period after spawn). Cancellation wakes the thread at once
//! instead of waiting out the sleep, and dropping the ticker cancels and joins
//! it, so no worker outlives its owner.

#![forbid(unsafe_code)]

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Default)]
struct Signal {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl Signal {
    fn cancel(&self) {
        *self.cancelled.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.wake.notify_all();
    }

    /// Sleep for `period` or until cancelled. Returns true when cancelled.
    fn wait(&self, period: Duration) -> bool {
        let guard = self.cancelled.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, period, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

#[derive(Debug)]
pub struct Ticker {
    name: String,
    signal: Arc<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Spawn a worker thread named `name` that calls `tick` every `period`.
    pub fn spawn<F>(name: impl Into<String>, period: Duration, mut tick: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let name = name.into();
        let signal = Arc::new(Signal::default());
        let worker_signal = Arc::clone(&signal);
        let worker_name = name.clone();
        let handle = std::thread::Builder::new().name(name.clone()).spawn(move || {
            tracing::info!(
                worker = %worker_name,
                interval_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
                "periodic worker started"
            );
            while !worker_signal.wait(period) {
                tick();
            }
            tracing::info!(worker = %worker_name, "periodic worker shutting down");
        })?;
        Ok(Self {
            name,
            signal,
            handle: Some(handle),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the worker to stop. Does not wait for it.
    pub fn cancel(&self) {
        self.signal.cancel();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.signal.cancel();
        if let Some(handle) = self.handle.take() {
            // A tick that drops its own ticker must not join itself.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn ticks_repeatedly_until_dropped() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let ticker = Ticker::spawn("test-ticker", Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        drop(ticker);
        let after_drop = hits.load(Ordering::SeqCst);
        assert!(after_drop >= 3);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), after_drop);
    }

    #[test]
    fn cancel_interrupts_long_period() {
        let ticker = Ticker::spawn("slow-ticker", Duration::from_secs(3600), || {}).unwrap();
        assert_eq!(ticker.name(), "slow-ticker");
        let started = Instant::now();
        ticker.cancel();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !ticker.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(ticker.is_finished());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
