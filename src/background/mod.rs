//! Background tasks — periodic maintenance jobs on the Tokio runtime.
//!
//! Operational chores (e.g. sweeping expired cache entries) run here, off the
//! request path. Nothing in the request-handling core depends on these jobs
//! running; they only release resources earlier than lazy cleanup would.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::trace;

/// Spawns a task that runs `job` every `period`, forever.
///
/// The first run happens one full `period` after spawning, not immediately.
/// A tick that falls behind (a slow job) is delayed rather than bursted.
/// Abort the returned handle to stop the loop; dropping it detaches.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use cachegate::background::spawn_periodic;
///
/// # #[tokio::main]
/// # async fn main() {
/// let handle = spawn_periodic("heartbeat", Duration::from_secs(30), || async {
///     tracing::info!("still here");
/// });
/// # handle.abort();
/// # }
/// ```
pub fn spawn_periodic<J, F>(name: &'static str, period: Duration, job: J) -> JoinHandle<()>
where
    J: Fn() -> F + Send + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = time::interval_at(time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            trace!(task = name, "running periodic job");
            job().await;
        }
    })
}
