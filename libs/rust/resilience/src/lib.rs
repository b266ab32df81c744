//! Resilience utilities for calls that leave the process: bounded retry with a
//! fixed backoff and a circuit breaker guarding a remote predictor.
use std::time::{Duration, Instant};
use thiserror::Error;
use parking_lot::Mutex;
use futures::Future;
use tracing::{warn, debug};
use prometheus::{IntCounter, register_int_counter};
use once_cell::sync::Lazy;

static RETRY_ATTEMPTS: Lazy<Option<IntCounter>> = Lazy::new(|| {
    register_int_counter!("dataplane_remote_retry_attempts_total", "Total retry attempts executed against remote models").ok()
});

static CIRCUIT_OPEN: Lazy<Option<IntCounter>> = Lazy::new(|| {
    register_int_counter!("dataplane_remote_circuit_open_total", "Number of times a remote model circuit transitioned to open").ok()
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResilienceError {
    #[error("circuit open")]
    CircuitOpen,
    #[error("no attempts configured")]
    NoAttempts,
}

/// Runs `f` up to `attempts` times, sleeping `delay` between failures.
/// Returns the last error once attempts are exhausted.
pub async fn retry_async<F, Fut, T, E>(mut f: F, attempts: usize, delay: Duration) -> Result<T, E>
where F: FnMut() -> Fut, Fut: Future<Output = Result<T, E>>, E: From<ResilienceError> {
    let mut last_err = None;
    for i in 0..attempts {
        if let Some(c) = RETRY_ATTEMPTS.as_ref() { c.inc(); }
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                last_err = Some(e);
                if i + 1 < attempts { debug!(attempt = i + 1, ?delay, "retrying"); tokio::time::sleep(delay).await; }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| ResilienceError::NoAttempts.into()))
}

pub struct CircuitBreaker {
    state: Mutex<State>,
    half_open_after: Duration,
    failure_threshold: u32,
}

struct State { failures: u32, opened_at: Option<Instant> }

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, half_open_after: Duration) -> Self { Self { state: Mutex::new(State { failures: 0, opened_at: None }), half_open_after, failure_threshold } }

    pub fn allow(&self) -> bool {
        let mut st = self.state.lock();
        if let Some(opened) = st.opened_at {
            if opened.elapsed() >= self.half_open_after { debug!("half-open trial"); st.opened_at = None; st.failures = 0; return true; }
            return false;
        }
        true
    }

    pub fn is_open(&self) -> bool { self.state.lock().opened_at.is_some() }

    pub fn record_success(&self) { let mut st = self.state.lock(); st.failures = 0; }

    pub fn record_failure(&self) {
        let mut st = self.state.lock();
        st.failures += 1;
        if st.failures >= self.failure_threshold && st.opened_at.is_none() {
            st.opened_at = Some(Instant::now());
            if let Some(c) = CIRCUIT_OPEN.as_ref() { c.inc(); }
            warn!(failures = st.failures, "circuit opened");
        }
    }

    /// Runs `op` when the breaker admits it, recording the outcome.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, E>
    where F: FnOnce() -> Fut, Fut: Future<Output = Result<T, E>>, E: From<ResilienceError> {
        self.call_if(op, |_| true).await
    }

    /// Like [`call`](Self::call), but only errors for which `counts` returns
    /// true are recorded as failures. Other errors pass through untouched.
    pub async fn call_if<F, Fut, T, E, P>(&self, op: F, counts: P) -> Result<T, E>
    where F: FnOnce() -> Fut, Fut: Future<Output = Result<T, E>>, E: From<ResilienceError>, P: FnOnce(&E) -> bool {
        if !self.allow() { return Err(ResilienceError::CircuitOpen.into()); }
        match op().await {
            Ok(v) => { self.record_success(); Ok(v) }
            Err(e) => {
                if counts(&e) { self.record_failure(); }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum TestErr { Boom, Resilience(ResilienceError) }
    impl From<ResilienceError> for TestErr { fn from(e: ResilienceError) -> Self { TestErr::Resilience(e) } }

    #[tokio::test]
    async fn test_retry() {
        let mut c = 0;
        let res: Result<u32, TestErr> = retry_async(|| { c += 1; let n = c; async move { if n < 3 { Err(TestErr::Boom) } else { Ok(42) } } }, 5, Duration::from_millis(1)).await;
        assert_eq!(res.unwrap(), 42);
        assert_eq!(c, 3);
    }

    #[tokio::test]
    async fn retry_is_bounded() {
        let mut c = 0;
        let res: Result<u32, TestErr> = retry_async(|| { c += 1; async { Err(TestErr::Boom) } }, 3, Duration::from_millis(1)).await;
        assert_eq!(res, Err(TestErr::Boom));
        assert_eq!(c, 3);
    }

    #[tokio::test]
    async fn zero_attempts_reports_no_attempts() {
        let res: Result<u32, TestErr> = retry_async(|| async { Ok(1) }, 0, Duration::from_millis(1)).await;
        assert_eq!(res, Err(TestErr::Resilience(ResilienceError::NoAttempts)));
    }

    #[tokio::test]
    async fn breaker_opens_then_half_opens() {
        let cb = CircuitBreaker::new(2, Duration::from_millis(5));
        for _ in 0..2 { let _ = cb.call(|| async { Err::<(), _>(TestErr::Boom) }).await; }
        assert!(cb.is_open());
        let blocked = cb.call(|| async { Ok::<(), TestErr>(()) }).await;
        assert_eq!(blocked, Err(TestErr::Resilience(ResilienceError::CircuitOpen)));
        tokio::time::sleep(Duration::from_millis(6)).await;
        assert!(cb.call(|| async { Ok::<(), TestErr>(()) }).await.is_ok());
        assert!(!cb.is_open());
    }

    #[tokio::test]
    async fn uncounted_errors_leave_breaker_closed() {
        let cb = CircuitBreaker::new(2, Duration::from_secs(60));
        for _ in 0..5 {
            let res = cb.call_if(|| async { Err::<(), _>(TestErr::Boom) }, |e| *e != TestErr::Boom).await;
            assert_eq!(res, Err(TestErr::Boom));
        }
        assert!(!cb.is_open());
        assert!(cb.call(|| async { Ok::<(), TestErr>(()) }).await.is_ok());
    }
}
