use crate::types::RemoteError;
use std::thread;
use std::time::Duration;
use tracing::warn;

/// Backoff schedule for remote calls.
///
/// Transient failures are retried up to `max_retries` times, sleeping
/// `base_delay`, then `base_delay * multiplier`, and so on. A request
/// rejected as too long is retried once with `max_tokens` scaled by
/// `shrink_factor`; that retry is not counted against `max_retries`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub shrink_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(30),
            multiplier: 1.5,
            shrink_factor: 0.8,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Self::default()
        }
    }

    /// Sleep before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.mul_f64(self.multiplier.powi(retry as i32))
    }

    /// Runs `call` until it succeeds or fails permanently. Oversized
    /// rejections are not retried.
    pub fn run<T>(&self, mut call: impl FnMut() -> Result<T, RemoteError>) -> Result<T, RemoteError> {
        self.execute(None, |_| call())
    }

    /// Like [`run`](Self::run), passing the current token budget to `call`
    /// and shrinking it once when the service reports the request as too long.
    pub fn run_with_shrink<T>(
        &self,
        max_tokens: u32,
        mut call: impl FnMut(u32) -> Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        self.execute(Some(max_tokens), |tokens| call(tokens.unwrap_or(max_tokens)))
    }

    fn execute<T>(
        &self,
        mut max_tokens: Option<u32>,
        mut call: impl FnMut(Option<u32>) -> Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        let mut attempts = 0u32;
        let mut retries = 0u32;
        let mut shrunk = false;

        loop {
            attempts += 1;
            let err = match call(max_tokens) {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match max_tokens {
                Some(tokens) if err.is_oversized() && !shrunk => {
                    let reduced = ((tokens as f64) * self.shrink_factor).floor().max(1.0) as u32;
                    warn!(from = tokens, to = reduced, "request too long, reducing max_tokens and retrying");
                    max_tokens = Some(reduced);
                    shrunk = true;
                    continue;
                }
                _ => {}
            }

            if !err.is_transient() {
                return Err(err);
            }
            if retries >= self.max_retries {
                return Err(RemoteError::RetriesExhausted {
                    attempts,
                    last: Box::new(err),
                });
            }

            let delay = self.delay_for(retries);
            warn!(
                error = %err,
                retry = retries + 1,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                "remote call failed, retrying"
            );
            thread::sleep(delay);
            retries += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn instant(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::ZERO)
    }

    #[test]
    fn defaults_follow_the_documented_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(30));
        assert_eq!(policy.delay_for(1), Duration::from_secs(45));
        assert_eq!(policy.delay_for(2), Duration::from_millis(67_500));
    }

    #[test]
    fn transient_failures_are_retried_until_success() {
        let calls = RefCell::new(0);
        let out = instant(3).run(|| {
            *calls.borrow_mut() += 1;
            if *calls.borrow() < 3 {
                Err(RemoteError::Transient("503".into()))
            } else {
                Ok("done")
            }
        });
        assert_eq!(out, Ok("done"));
        assert_eq!(*calls.borrow(), 3);
    }

    #[test]
    fn retries_are_bounded() {
        let calls = RefCell::new(0);
        let out: Result<(), _> = instant(3).run(|| {
            *calls.borrow_mut() += 1;
            Err(RemoteError::RateLimited("429".into()))
        });
        assert_eq!(*calls.borrow(), 4);
        match out {
            Err(RemoteError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 4);
                assert_eq!(*last, RemoteError::RateLimited("429".into()));
            }
            other => panic!("expected exhausted retries, got {:?}", other),
        }
    }

    #[test]
    fn permanent_failures_are_not_retried() {
        let calls = RefCell::new(0);
        let out: Result<(), _> = instant(3).run(|| {
            *calls.borrow_mut() += 1;
            Err(RemoteError::Authentication("401".into()))
        });
        assert_eq!(*calls.borrow(), 1);
        assert_eq!(out, Err(RemoteError::Authentication("401".into())));
    }

    #[test]
    fn oversized_request_shrinks_once_without_using_the_budget() {
        let seen = RefCell::new(Vec::new());
        let out = instant(0).run_with_shrink(1000, |tokens| {
            seen.borrow_mut().push(tokens);
            if tokens == 1000 {
                Err(RemoteError::Oversized("reduce your prompt".into()))
            } else {
                Ok(tokens)
            }
        });
        assert_eq!(out, Ok(800));
        assert_eq!(*seen.borrow(), vec![1000, 800]);
    }

    #[test]
    fn oversized_twice_is_final() {
        let calls = RefCell::new(0);
        let out: Result<(), _> = instant(3).run_with_shrink(100, |_| {
            *calls.borrow_mut() += 1;
            Err(RemoteError::Oversized("still too long".into()))
        });
        assert_eq!(*calls.borrow(), 2);
        assert!(matches!(out, Err(RemoteError::Oversized(_))));
    }

    #[test]
    fn oversized_without_a_token_budget_is_final() {
        let calls = RefCell::new(0);
        let out: Result<(), _> = instant(3).run(|| {
            *calls.borrow_mut() += 1;
            Err(RemoteError::Oversized("too many inputs".into()))
        });
        assert_eq!(*calls.borrow(), 1);
        assert!(out.is_err());
    }
}
