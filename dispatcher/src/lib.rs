//! Bounded fan-out of one blocking request per item, with results handed
//! back in input order.

use crossbeam_channel::unbounded;
use shared::core::constants::MAX_WORKERS;
use shared::ConfigError;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{debug, warn};

pub use shared::FailurePolicy;

/// The item that ended a fail-fast dispatch.
#[derive(Debug, thiserror::Error)]
#[error("item {index} failed: {error}")]
pub struct ItemFailure<E: Display> {
    /// Position of the item in the slice passed to `dispatch`.
    pub index: usize,
    pub error: E,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchDispatcher {
    concurrency: usize,
    policy: FailurePolicy,
}

impl BatchDispatcher {
    pub fn new(concurrency: usize, policy: FailurePolicy) -> Result<Self, ConfigError> {
        if concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: MAX_WORKERS,
                value: "0".into(),
                reason: "at least one worker is required".into(),
            });
        }
        Ok(Self { concurrency, policy })
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Runs `request` once per item on at most `concurrency` worker threads.
    ///
    /// `results[i]` always belongs to `items[i]`, whatever order the requests
    /// complete in. Under `FailFast` the first failure stops further items
    /// from being started and the lowest-index failure is returned; items
    /// already in flight finish but their results are discarded. Under
    /// `Tolerate` every item runs and failures come back in place.
    pub fn dispatch<T, R, E, F>(
        &self,
        items: &[T],
        request: F,
    ) -> Result<Vec<Result<R, E>>, ItemFailure<E>>
    where
        T: Sync,
        R: Send,
        E: Send + Display,
        F: Fn(&T) -> Result<R, E> + Sync,
    {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let workers = self.concurrency.min(items.len());
        let fail_fast = self.policy == FailurePolicy::FailFast;
        let abort = AtomicBool::new(false);

        let (job_tx, job_rx) = unbounded::<usize>();
        for index in 0..items.len() {
            // The receiver is alive until the end of this function.
            let _ = job_tx.send(index);
        }
        drop(job_tx);

        let (done_tx, done_rx) = unbounded::<(usize, Result<R, E>)>();

        thread::scope(|scope| {
            for worker in 0..workers {
                let job_rx = job_rx.clone();
                let done_tx = done_tx.clone();
                let abort = &abort;
                let request = &request;
                scope.spawn(move || {
                    for index in job_rx.iter() {
                        if abort.load(Ordering::Acquire) {
                            break;
                        }
                        let outcome = request(&items[index]);
                        if fail_fast && outcome.is_err() {
                            abort.store(true, Ordering::Release);
                        }
                        if done_tx.send((index, outcome)).is_err() {
                            break;
                        }
                    }
                    debug!(worker, "dispatch worker finished");
                });
            }
        });
        drop(done_tx);

        let mut slots: Vec<Option<Result<R, E>>> = items.iter().map(|_| None).collect();
        for (index, outcome) in done_rx.iter() {
            slots[index] = Some(outcome);
        }

        if fail_fast {
            // Jobs are handed out in index order, so every item below the
            // first failure has been run.
            let first_failure = slots
                .iter()
                .position(|slot| matches!(slot, Some(Err(_))));
            if let Some(index) = first_failure {
                if let Some(Err(error)) = slots[index].take() {
                    return Err(ItemFailure { index, error });
                }
            }
        }

        let results: Vec<Result<R, E>> = slots.into_iter().flatten().collect();
        debug_assert_eq!(results.len(), items.len());
        for (index, result) in results.iter().enumerate() {
            if let Err(error) = result {
                warn!(index, error = %error, "item failed, continuing");
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    fn dispatcher(concurrency: usize, policy: FailurePolicy) -> BatchDispatcher {
        BatchDispatcher::new(concurrency, policy).unwrap()
    }

    #[test]
    fn zero_workers_is_rejected() {
        assert!(matches!(
            BatchDispatcher::new(0, FailurePolicy::FailFast),
            Err(ConfigError::Invalid { key: MAX_WORKERS, .. })
        ));
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let out = dispatcher(3, FailurePolicy::FailFast)
            .dispatch(&[] as &[u32], |_| Ok::<_, String>(1))
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn results_follow_input_order_not_completion_order() {
        let items: Vec<u64> = (0..6).collect();
        let completed = Mutex::new(Vec::new());
        let out = dispatcher(6, FailurePolicy::FailFast)
            .dispatch(&items, |item| {
                // Later items finish first.
                thread::sleep(Duration::from_millis((6 - item) * 15));
                completed.lock().unwrap().push(*item);
                Ok::<_, String>(item * 10)
            })
            .unwrap();

        let values: Vec<u64> = out.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec![0, 10, 20, 30, 40, 50]);
        let completed = completed.into_inner().unwrap();
        assert_ne!(completed, items, "requests should have completed out of order");
    }

    #[test]
    fn never_exceeds_the_concurrency_bound() {
        let items: Vec<u32> = (0..12).collect();
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        dispatcher(3, FailurePolicy::FailFast)
            .dispatch(&items, |_| {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .unwrap();
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= 3 && peak >= 1, "peak concurrency was {}", peak);
    }

    #[test]
    fn requests_overlap_in_time() {
        let items = [0u8; 4];
        let started = Instant::now();
        dispatcher(4, FailurePolicy::FailFast)
            .dispatch(&items, |_| {
                thread::sleep(Duration::from_millis(100));
                Ok::<_, String>(())
            })
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(350));
    }

    #[test]
    fn fail_fast_reports_the_lowest_failing_index() {
        let items: Vec<u32> = (0..8).collect();
        let err = dispatcher(4, FailurePolicy::FailFast)
            .dispatch(&items, |item| {
                if *item == 5 {
                    thread::sleep(Duration::from_millis(20));
                    Err(format!("boom {}", item))
                } else if *item == 2 {
                    thread::sleep(Duration::from_millis(40));
                    Err(format!("boom {}", item))
                } else {
                    Ok(*item)
                }
            })
            .unwrap_err();
        assert_eq!(err.index, 2);
        assert_eq!(err.error, "boom 2");
    }

    #[test]
    fn fail_fast_stops_handing_out_work() {
        let items: Vec<u32> = (0..50).collect();
        let calls = AtomicUsize::new(0);
        let result = dispatcher(1, FailurePolicy::FailFast).dispatch(&items, |item| {
            calls.fetch_add(1, Ordering::SeqCst);
            if *item == 3 {
                Err("stop".to_string())
            } else {
                Ok(())
            }
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn tolerate_keeps_failures_in_place() {
        let items: Vec<u32> = (0..5).collect();
        let out = dispatcher(2, FailurePolicy::Tolerate)
            .dispatch(&items, |item| {
                if item % 2 == 1 {
                    Err(format!("odd {}", item))
                } else {
                    Ok(*item)
                }
            })
            .unwrap();
        assert_eq!(out.len(), 5);
        assert_eq!(out[0], Ok(0));
        assert_eq!(out[1], Err("odd 1".to_string()));
        assert_eq!(out[4], Ok(4));
    }

    #[test]
    fn more_workers_than_items_is_fine() {
        let out = dispatcher(16, FailurePolicy::FailFast)
            .dispatch(&["a", "b"], |s| Ok::<_, String>(s.to_uppercase()))
            .unwrap();
        assert_eq!(out, vec![Ok("A".to_string()), Ok("B".to_string())]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn output_aligns_with_input(
            items in prop::collection::vec(0u64..1000, 0..40),
            concurrency in 1usize..8,
        ) {
            let out = dispatcher(concurrency, FailurePolicy::Tolerate)
                .dispatch(&items, |x| {
                    thread::sleep(Duration::from_micros(x % 7 * 50));
                    Ok::<_, String>(x * 2)
                })
                .unwrap();
            let doubled: Vec<u64> = out.into_iter().map(Result::unwrap).collect();
            prop_assert_eq!(doubled, items.iter().map(|x| x * 2).collect::<Vec<_>>());
        }
    }
}
