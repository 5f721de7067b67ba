//! Per-key single-flight execution.
//!
//! Concurrent callers for the same key share one in-flight computation: the
//! first caller becomes the *leader* and runs the work, every other caller
//! *attaches* as a waiter and receives a clone of the published result. The
//! in-flight record is retired once the result is delivered, so the next
//! caller for that key starts fresh.
//!
//! The flight table lives behind a `std::sync::Mutex` that is never held
//! across an await; publication and waiting go through a per-key
//! [`watch`] channel, which gives the publish-once / observe-many shape and —
//! because a closed channel is distinguishable from a published value — lets
//! waiters detect a leader that died without publishing and take over.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

// What a caller turned out to be for one attempt at a key.
enum Role<T> {
    Leader(watch::Sender<Option<T>>),
    Waiter(watch::Receiver<Option<T>>),
}

/// Coalesces concurrent duplicate computations per string key.
///
/// [`run`](Self::run) never fails and never executes more than one `compute`
/// per key at a time; computations for different keys proceed fully in
/// parallel. Failure delivery is the value type's job: use a `T` that carries
/// the error (`Result`, or a struct with an error field) and every coalesced
/// caller receives it verbatim.
///
/// # Examples
///
/// ```
/// use cachegate::cache::Singleflight;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let flights: Singleflight<u32> = Singleflight::new();
/// let value = flights.run("/data.json", async { 42 }).await;
/// assert_eq!(value, 42);
/// # }
/// ```
pub struct Singleflight<T> {
    flights: Mutex<HashMap<String, watch::Receiver<Option<T>>>>,
}

impl<T: Clone> Singleflight<T> {
    /// Creates an empty flight table.
    pub fn new() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }

    fn flights(&self) -> MutexGuard<'_, HashMap<String, watch::Receiver<Option<T>>>> {
        self.flights.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `compute` for `key`, coalescing with any computation already in
    /// flight for the same key.
    ///
    /// If no flight exists, the caller becomes the leader: it awaits
    /// `compute`, publishes the result to every waiter that attached in the
    /// meantime, retires the key, and returns the result. If a flight exists,
    /// the caller suspends until the leader publishes and returns a clone of
    /// the identical result — its own `compute` is dropped without ever being
    /// polled.
    ///
    /// A waiter whose leader disappears without publishing (the leader task
    /// panicked or was dropped) retires the dead record and retries, so no
    /// caller is stranded.
    pub async fn run<F>(&self, key: &str, compute: F) -> T
    where
        F: Future<Output = T>,
    {
        loop {
            let role = {
                let mut flights = self.flights();
                match flights.get(key) {
                    Some(rx) => Role::Waiter(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        flights.insert(key.to_owned(), rx);
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Leader(tx) => {
                    let value = compute.await;
                    // Publish before retiring the key: anyone who attached
                    // while the flight existed observes the finalized value.
                    tx.send_replace(Some(value.clone()));
                    self.flights().remove(key);
                    return value;
                }
                Role::Waiter(mut rx) => {
                    match rx.wait_for(Option::is_some).await {
                        Ok(published) => {
                            if let Some(value) = published.as_ref() {
                                return value.clone();
                            }
                        }
                        Err(_) => {
                            // The leader vanished without publishing. Retire
                            // the registered record if it is dead too (a
                            // healthy successor flight stays), then start over.
                            let mut flights = self.flights();
                            let dead = flights
                                .get(key)
                                .is_some_and(|current| current.has_changed().is_err());
                            if dead {
                                flights.remove(key);
                            }
                        }
                    }
                }
            }
        }
    }
}

impl<T: Clone> Default for Singleflight<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::watch;

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let flights: Arc<Singleflight<String>> = Arc::new(Singleflight::new());
        let executions = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = watch::channel(false);

        let leader = tokio::spawn({
            let flights = Arc::clone(&flights);
            let executions = Arc::clone(&executions);
            let mut release = release_rx.clone();
            async move {
                flights
                    .run("/k", async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        let _ = release.wait_for(|released| *released).await;
                        "computed".to_owned()
                    })
                    .await
            }
        });
        // Let the leader claim the key and block inside its computation.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let waiter = tokio::spawn({
            let flights = Arc::clone(&flights);
            let executions = Arc::clone(&executions);
            async move {
                flights
                    .run("/k", async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        "should never run".to_owned()
                    })
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        release_tx.send(true).unwrap();

        assert_eq!(leader.await.unwrap(), "computed");
        assert_eq!(waiter.await.unwrap(), "computed");
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sequential_calls_recompute() {
        let flights: Singleflight<u32> = Singleflight::new();
        let executions = AtomicUsize::new(0);

        for expected in [1, 2] {
            let value = flights
                .run("/k", async {
                    executions.fetch_add(1, Ordering::SeqCst);
                    expected
                })
                .await;
            assert_eq!(value, expected);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn distinct_keys_run_in_parallel() {
        let flights: Arc<Singleflight<&'static str>> = Arc::new(Singleflight::new());
        let executions = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = watch::channel(false);

        let mut tasks = Vec::new();
        for (key, value) in [("/a", "A"), ("/b", "B")] {
            tasks.push(tokio::spawn({
                let flights = Arc::clone(&flights);
                let executions = Arc::clone(&executions);
                let mut release = release_rx.clone();
                async move {
                    flights
                        .run(key, async move {
                            executions.fetch_add(1, Ordering::SeqCst);
                            let _ = release.wait_for(|released| *released).await;
                            value
                        })
                        .await
                }
            }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Both leaders are in flight at once — neither blocked the other.
        assert_eq!(executions.load(Ordering::SeqCst), 2);
        release_tx.send(true).unwrap();

        let a = tasks.remove(0).await.unwrap();
        let b = tasks.remove(0).await.unwrap();
        assert_eq!((a, b), ("A", "B"));
    }

    #[tokio::test]
    async fn waiter_takes_over_after_leader_panics() {
        let flights: Arc<Singleflight<String>> = Arc::new(Singleflight::new());
        let (release_tx, release_rx) = watch::channel(false);

        let doomed = tokio::spawn({
            let flights = Arc::clone(&flights);
            let mut release = release_rx.clone();
            async move {
                flights
                    .run("/k", async move {
                        let _ = release.wait_for(|released| *released).await;
                        panic!("leader died");
                    })
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let survivor = tokio::spawn({
            let flights = Arc::clone(&flights);
            async move {
                flights
                    .run("/k", async move { "recovered".to_owned() })
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        release_tx.send(true).unwrap();
        assert!(doomed.await.is_err());
        assert_eq!(survivor.await.unwrap(), "recovered");
    }
}
