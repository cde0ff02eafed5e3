//! A single-flight registry to suppress duplicate origin loads.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

use stowage_core::{CacheError, CacheResult};
use tokio::sync::watch;

type Slot<T> = Option<CacheResult<T>>;

/// Ensures at most one in-flight load per key.
///
/// Concurrent callers for the same key wait for the first caller's load and
/// receive a clone of its outcome, success or error. Nothing is memoized:
/// once a load completes its entry is gone and the next caller starts a new
/// one.
pub struct SingleFlight<K, T> {
    calls: Mutex<HashMap<K, watch::Receiver<Slot<T>>>>,
}

impl<K, T> std::fmt::Debug for SingleFlight<K, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight").finish_non_exhaustive()
    }
}

impl<K, T> Default for SingleFlight<K, T> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

enum Role<T> {
    Leader(watch::Sender<Slot<T>>),
    Waiter(watch::Receiver<Slot<T>>),
}

/// Removes the leader's entry when the load finishes or is dropped.
struct LeaderGuard<'a, K: Eq + Hash, T> {
    flight: &'a SingleFlight<K, T>,
    key: &'a K,
    rx: watch::Receiver<Slot<T>>,
}

impl<K: Eq + Hash, T> Drop for LeaderGuard<'_, K, T> {
    fn drop(&mut self) {
        let mut calls = self.flight.lock();
        // A later leader may own the slot by now.
        if calls
            .get(self.key)
            .is_some_and(|current| current.same_channel(&self.rx))
        {
            calls.remove(self.key);
        }
    }
}

impl<K, T> SingleFlight<K, T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, watch::Receiver<Slot<T>>>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of keys with a load in progress.
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    /// Run `load` for `key`, or join the load already running for it.
    ///
    /// `load` is only polled when this caller becomes the leader. If the
    /// leader is dropped before finishing, waiters fail with
    /// `InternalServerError`.
    pub async fn work<F>(&self, key: &K, load: F) -> CacheResult<T>
    where
        F: Future<Output = CacheResult<T>>,
    {
        let role = {
            let mut calls = self.lock();
            match calls.entry(key.clone()) {
                Entry::Occupied(occupied) => Role::Waiter(occupied.get().clone()),
                Entry::Vacant(vacant) => {
                    let (tx, rx) = watch::channel(None);
                    vacant.insert(rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Waiter(mut rx) => match rx.wait_for(Option::is_some).await {
                Ok(slot) => (*slot).clone().unwrap_or_else(|| Err(abandoned())),
                Err(_) => Err(abandoned()),
            },
            Role::Leader(tx) => {
                let guard = LeaderGuard {
                    flight: self,
                    key,
                    rx: tx.subscribe(),
                };
                let result = load.await;
                drop(guard);
                tx.send_replace(Some(result.clone()));
                result
            }
        }
    }
}

fn abandoned() -> CacheError {
    CacheError::internal("in-flight load abandoned")
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_load() {
        let flight = SingleFlight::<String, String>::new();
        let calls = AtomicUsize::new(0);
        let key = "user:1".to_string();

        let (flight_ref, calls_ref, key_ref) = (&flight, &calls, &key);
        let results = join_all((0..8).map(|_| async move {
            flight_ref
                .work(key_ref, async move {
                    calls_ref.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok("alice".to_string())
                })
                .await
        }))
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap(), "alice");
        }
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_fan_out_to_waiters() {
        let flight = SingleFlight::<u64, String>::new();

        let flight_ref = &flight;
        let results = join_all((0..4).map(|_| async move {
            flight_ref
                .work(&7, async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Err(CacheError::not_found("no such row"))
                })
                .await
        }))
        .await;

        assert!(results
            .iter()
            .all(|r| r.as_ref().unwrap_err().is_not_found()));
    }

    #[tokio::test]
    async fn test_completed_loads_are_not_memoized() {
        let flight = SingleFlight::<u64, u64>::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let value = flight
                .work(&1, async { Ok(calls.fetch_add(1, Ordering::SeqCst) as u64) })
                .await
                .unwrap();
            assert_eq!(value as usize, calls.load(Ordering::SeqCst) - 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_run_independently() {
        let flight = SingleFlight::<u64, u64>::new();
        let calls = AtomicUsize::new(0);

        let results = join_all((0..3u64).map(|id| {
            let calls = &calls;
            let flight = &flight;
            async move {
                flight
                    .work(&id, async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(id * 10)
                    })
                    .await
            }
        }))
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let values: Vec<u64> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec![0, 10, 20]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_leader_fails_waiters() {
        let flight = SingleFlight::<u64, String>::new();

        let leader = tokio::time::timeout(
            Duration::from_secs(1),
            flight.work(&1, async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok("late".to_string())
            }),
        );
        let waiter = flight.work(&1, async { Ok("never polled".to_string()) });

        let (leader, waiter) = tokio::join!(leader, waiter);
        assert!(leader.is_err());
        assert!(waiter.unwrap_err().is_internal());
        assert_eq!(flight.in_flight(), 0);
    }
}
