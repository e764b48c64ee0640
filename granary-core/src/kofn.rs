//! Concurrent collection of K successful results out of N attempts
//!
//! Used by repair workers that need K pieces out of N candidates: up to
//! `concurrency` operations run at once, dispatch stops while the work
//! already in flight could satisfy the remaining requirements (plus a
//! `long_tail` allowance of extra racers), and once requirements are met
//! every superfluous in-flight operation is cancelled.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::Error;

/// Collection behavior.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Maximum concurrent operations.
    pub concurrency: usize,
    /// Extra operations allowed in flight beyond what the remaining
    /// requirements strictly need; losers are cancelled on completion.
    pub long_tail: usize,
    /// Successful results required before stopping (K).
    pub required_successes: usize,
    /// Failed results required before stopping; 0 to not wait for any.
    pub required_failures: usize,
}

/// A successful operation, in completion order.
#[derive(Debug)]
pub struct Success<R> {
    /// Index of the item in the input list.
    pub index: usize,
    /// The operation's result.
    pub value: R,
}

/// A failed operation, in completion order.
#[derive(Debug)]
pub struct Failure {
    /// Index of the item in the input list.
    pub index: usize,
    /// What went wrong.
    pub error: Error,
}

struct State<R> {
    required_successes: usize,
    required_failures: usize,
    long_tail: usize,

    success_count: usize,
    failure_count: usize,
    active: usize,
    pending: usize,

    successes: Vec<Success<R>>,
    failures: Vec<Failure>,
    cancels: HashMap<usize, CancellationToken>,
    done_cancelled: bool,
}

impl<R> State<R> {
    fn done(&self) -> bool {
        self.success_count >= self.required_successes
            && self.failure_count >= self.required_failures
    }

    fn impossible(&self) -> bool {
        let reachable = self.active + self.pending;
        self.success_count + reachable < self.required_successes
            || self.failure_count + reachable < self.required_failures
    }

    fn saturated(&self) -> bool {
        self.success_count + self.active >= self.required_successes + self.long_tail
            && self.failure_count + self.active >= self.required_failures
    }
}

enum Dispatch {
    Stop,
    Wait,
    Run(CancellationToken),
}

/// Locks `state`, decides what the caller should do next, and drops the
/// lock before returning; kept as a plain (non-async) function so the
/// `parking_lot::MutexGuard` never needs to be `Send` across an `.await`.
fn dispatch<R>(
    state: &Mutex<State<R>>,
    tx: &watch::Sender<u64>,
    parent: &CancellationToken,
    index: usize,
) -> Dispatch {
    let mut st = state.lock();
    if st.done() {
        if !st.done_cancelled {
            st.done_cancelled = true;
            for cancel in st.cancels.values() {
                cancel.cancel();
            }
        }
        drop(st);
        tx.send_modify(|v| *v += 1);
        return Dispatch::Stop;
    }
    if st.impossible() || parent.is_cancelled() {
        drop(st);
        tx.send_modify(|v| *v += 1);
        return Dispatch::Stop;
    }
    if st.saturated() {
        return Dispatch::Wait;
    }
    st.pending -= 1;
    st.active += 1;
    let token = parent.child_token();
    st.cancels.insert(index, token.clone());
    Dispatch::Run(token)
}

/// Run operations over `items`, collecting results until
/// `required_successes` and `required_failures` are both met. Items where
/// `skip` returns true are never dispatched. Results come back in
/// completion order carrying their original indices.
pub async fn collect<T, R, F, Fut>(
    parent: &CancellationToken,
    config: Config,
    items: Vec<T>,
    skip: impl Fn(&T) -> bool,
    op: F,
) -> (Vec<Success<R>>, Vec<Failure>)
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(CancellationToken, usize, T) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = crate::Result<R>> + Send + 'static,
{
    let runnable: Vec<(usize, T)> = items
        .into_iter()
        .enumerate()
        .filter(|(_, item)| !skip(item))
        .collect();
    if runnable.is_empty() {
        return (Vec::new(), Vec::new());
    }

    let state = Arc::new(Mutex::new(State::<R> {
        required_successes: config.required_successes,
        required_failures: config.required_failures,
        long_tail: config.long_tail,
        success_count: 0,
        failure_count: 0,
        active: 0,
        pending: runnable.len(),
        successes: Vec::new(),
        failures: Vec::new(),
        cancels: HashMap::new(),
        done_cancelled: false,
    }));
    let (tx, rx) = watch::channel(0u64);
    let tx = Arc::new(tx);
    let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));

    let mut tasks = JoinSet::new();
    for (index, item) in runnable {
        let state = state.clone();
        let tx = tx.clone();
        let mut rx = rx.clone();
        let semaphore = semaphore.clone();
        let parent = parent.clone();
        let op = op.clone();
        tasks.spawn(async move {
            let Ok(_permit) = semaphore.acquire().await else {
                return;
            };
            let mut item = Some(item);
            loop {
                // observe the version before inspecting state so a wake
                // between unlock and await is never missed
                rx.borrow_and_update();

                let token = match dispatch(&state, &tx, &parent, index) {
                    Dispatch::Stop => return,
                    Dispatch::Wait => {
                        let _ = rx.changed().await;
                        continue;
                    }
                    Dispatch::Run(token) => token,
                };

                let Some(item) = item.take() else {
                    return;
                };
                let result = op(token.clone(), index, item).await;
                token.cancel();

                let mut st = state.lock();
                st.active -= 1;
                st.cancels.remove(&index);
                match result {
                    Ok(value) => {
                        st.successes.push(Success { index, value });
                        st.success_count += 1;
                    }
                    Err(error) => {
                        st.failures.push(Failure { index, error });
                        st.failure_count += 1;
                    }
                }
                // this result may have completed the requirements while
                // long-tail racers are still in flight
                if st.done() && !st.done_cancelled {
                    st.done_cancelled = true;
                    for cancel in st.cancels.values() {
                        cancel.cancel();
                    }
                }
                drop(st);
                tx.send_modify(|v| *v += 1);
                return;
            }
        });
    }

    while tasks.join_next().await.is_some() {}

    let mut st = state.lock();
    (
        std::mem::take(&mut st.successes),
        std::mem::take(&mut st.failures),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config(required_successes: usize, required_failures: usize) -> Config {
        Config {
            concurrency: 8,
            long_tail: 0,
            required_successes,
            required_failures,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_basic_success() {
        let items: Vec<i32> = (1..=10).collect();
        let (successes, failures) = collect(
            &CancellationToken::new(),
            config(3, 0),
            items,
            |_| false,
            |_token, _index, item| async move { Ok(format!("result-{item}")) },
        )
        .await;

        assert!(successes.len() >= 3);
        assert!(failures.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_basic_failure() {
        let items: Vec<i32> = (1..=5).collect();
        let (successes, failures) = collect(
            &CancellationToken::new(),
            config(0, 5),
            items,
            |_| false,
            |_token, _index, _item| async move {
                Err::<(), _>(Error::Io(std::io::Error::other("always fails")))
            },
        )
        .await;

        assert!(successes.is_empty());
        assert_eq!(failures.len(), 5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_mixed_results() {
        let items: Vec<usize> = (0..10).collect();
        let (successes, failures) = collect(
            &CancellationToken::new(),
            config(3, 2),
            items,
            |_| false,
            |_token, _index, item| async move {
                if item % 2 == 0 {
                    Ok(item)
                } else {
                    Err(Error::Io(std::io::Error::other(format!("failure-{item}"))))
                }
            },
        )
        .await;

        assert!(successes.len() >= 3);
        assert!(failures.len() >= 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_skipped_items_never_dispatched() {
        let items: Vec<Option<i32>> = vec![Some(1), None, Some(2), None, Some(3), Some(4), Some(5)];
        let dispatched = Arc::new(Mutex::new(Vec::new()));
        let seen = dispatched.clone();
        let (successes, failures) = collect(
            &CancellationToken::new(),
            config(3, 0),
            items,
            |item| item.is_none(),
            move |_token, index, item| {
                let seen = seen.clone();
                async move {
                    seen.lock().push(index);
                    Ok(item.unwrap())
                }
            },
        )
        .await;

        assert!(successes.len() >= 3);
        assert!(failures.is_empty());
        for index in dispatched.lock().iter() {
            assert_ne!(*index, 1);
            assert_ne!(*index, 3);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_impossible_requirement_returns() {
        let items: Vec<i32> = vec![1, 2];
        let (successes, failures) = collect(
            &CancellationToken::new(),
            config(3, 0),
            items,
            |_| false,
            |_token, _index, item| async move { Ok(item) },
        )
        .await;

        // 2 candidates can never produce 3 successes; nothing runs
        assert!(successes.is_empty());
        assert!(failures.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failure_releases_another_dispatch() {
        let items: Vec<usize> = (0..10).collect();
        let (successes, failures) = collect(
            &CancellationToken::new(),
            config(3, 0),
            items,
            |_| false,
            |_token, index, _item| async move {
                if index == 0 {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Err(Error::Io(std::io::Error::other("slow failure")))
                } else {
                    Ok(index)
                }
            },
        )
        .await;

        assert!(successes.len() >= 3);
        assert!(failures.len() <= 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_long_tail_losers_are_cancelled() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let counter = cancelled.clone();
        let items: Vec<usize> = vec![0, 1];
        let (successes, failures) = collect(
            &CancellationToken::new(),
            Config {
                concurrency: 2,
                long_tail: 1,
                required_successes: 1,
                required_failures: 0,
            },
            items,
            |_| false,
            move |token, index, _item| {
                let counter = counter.clone();
                async move {
                    if index == 0 {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(index)
                    } else {
                        // the long-tail racer only finishes via cancellation
                        token.cancelled().await;
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(Error::Cancelled)
                    }
                }
            },
        )
        .await;

        assert_eq!(successes.len(), 1);
        assert_eq!(successes[0].index, 0);
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0].error, Error::Cancelled));
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_parent_cancellation_stops_dispatch() {
        let parent = CancellationToken::new();
        parent.cancel();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let (successes, _failures) = collect(
            &parent,
            config(2, 0),
            vec![1, 2, 3],
            |_| false,
            move |_token, _index, item| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(item)
                }
            },
        )
        .await;

        assert!(successes.is_empty());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
