//! The caching middleware: suffix eligibility, single-flight coalescing,
//! response capture, and replay.

use std::num::NonZeroUsize;
use std::sync::Arc;

use tracing::debug;

use crate::http::Request;
use crate::middleware::{HandlerError, HandlerFuture, Middleware, Next, ResponseSink, SinkHandle};

use super::capture::ResponseCapture;
use super::singleflight::Singleflight;
use super::store::{CacheStore, CachedResponse};
use super::{CacheConfig, ConfigError};

/// The content type stamped on every replayed response.
///
/// One fixed constant rather than an echo of whatever the downstream handler
/// produced: the middleware is aimed at JSON API path suffixes.
pub const REPLAY_CONTENT_TYPE: &str = "application/json";

// What one coalesced computation yields: the finalized response plus the
// downstream error, if any. Cloneable so the flight can fan it out to every
// attached waiter verbatim.
#[derive(Clone)]
struct FlightOutcome {
    response: Arc<CachedResponse>,
    error: Option<HandlerError>,
}

/// Middleware that serves eligible requests from a bounded, TTL-limited
/// in-memory cache and coalesces concurrent misses for the same path into a
/// single downstream computation.
///
/// A request is *eligible* when its path ends with the configured suffix
/// (exact, byte-wise, case-sensitive); everything else is forwarded
/// untouched. The cache key is the request path alone — method and query
/// string are deliberately not part of it.
///
/// On a miss, the downstream handler runs against a [`ResponseCapture`]
/// instead of the real sink; the finalized snapshot is stored (only if the
/// handler succeeded) and replayed to the caller and to every request that
/// coalesced onto the same path: the entry's status code and body, a fixed
/// `Content-Type` ([`REPLAY_CONTENT_TYPE`]), and a `Content-Length` matching
/// the body. A downstream error is returned to each coalesced caller, but
/// the captured bytes are still written.
///
/// Each middleware owns its store and flight table; to share one cache
/// between several instances, pass the same store to
/// [`with_store`](Self::with_store).
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use cachegate::cache::{CacheConfig, CacheMiddleware};
/// use cachegate::middleware::from_middleware;
///
/// let cache = CacheMiddleware::new(CacheConfig::new(".json")).unwrap();
/// let handler = from_middleware(Arc::new(cache));
/// ```
pub struct CacheMiddleware {
    suffix: String,
    store: Arc<CacheStore>,
    flights: Arc<Singleflight<FlightOutcome>>,
}

impl CacheMiddleware {
    /// Builds the middleware with its own store sized by `config`.
    ///
    /// # Errors
    ///
    /// Any [`ConfigError`] from [`CacheConfig::validate`].
    pub fn new(config: CacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let capacity = NonZeroUsize::new(config.capacity).ok_or(ConfigError::ZeroCapacity)?;
        let store = Arc::new(CacheStore::new(capacity, config.ttl));
        Self::with_store(config, store)
    }

    /// Builds the middleware around an existing store.
    ///
    /// This is how several middleware instances share one cache: the sharing
    /// is an explicit constructor parameter, not an ambient global. The
    /// flight table stays per-instance. Note that `config.capacity` and
    /// `config.ttl` are properties of the store — only the suffix applies
    /// here.
    ///
    /// # Errors
    ///
    /// Any [`ConfigError`] from [`CacheConfig::validate`].
    pub fn with_store(config: CacheConfig, store: Arc<CacheStore>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            suffix: config.suffix,
            store,
            flights: Arc::new(Singleflight::new()),
        })
    }

    /// Returns the underlying store, e.g. to spawn its sweeper or to share it
    /// with another middleware instance.
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }
}

impl Middleware for CacheMiddleware {
    fn handle(&self, request: Arc<Request>, sink: SinkHandle, next: Next) -> HandlerFuture {
        // Ineligible paths bypass the cache and the coalescer entirely.
        if !request.path().ends_with(&self.suffix) {
            return Box::pin(next.run(request, sink));
        }

        let store = Arc::clone(&self.store);
        let flights = Arc::clone(&self.flights);

        Box::pin(async move {
            let key = request.path().to_owned();

            // Only the flight leader polls this; coalesced waiters drop it
            // unexecuted, so their `next` is never invoked.
            let compute = {
                let store = Arc::clone(&store);
                let key = key.clone();
                async move {
                    if let Some(response) = store.get(&key) {
                        debug!(key = %key, "cache hit");
                        return FlightOutcome {
                            response,
                            error: None,
                        };
                    }

                    debug!(key = %key, "cache miss, invoking downstream");
                    let capture = Arc::new(ResponseCapture::new());
                    let result = next
                        .run(request, Arc::clone(&capture) as SinkHandle)
                        .await;
                    capture.finish();
                    let response = Arc::new(capture.snapshot().await);

                    if result.is_ok() {
                        store.insert(key.clone(), Arc::clone(&response));
                    } else {
                        debug!(key = %key, "downstream failed, not caching");
                    }
                    FlightOutcome {
                        response,
                        error: result.err(),
                    }
                }
            };

            let FlightOutcome { response, error } = flights.run(&key, compute).await;

            sink.insert_header("Content-Type", REPLAY_CONTENT_TYPE);
            sink.insert_header("Content-Length", &response.body_len().to_string());
            sink.set_status(response.status);
            sink.write(&response.body);

            match error {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::StatusCode;
    use crate::middleware::{MiddlewareHandler, from_handler, from_middleware};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::watch;

    fn request(target: &str) -> Arc<Request> {
        let raw = format!("GET {target} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let (req, _) = Request::parse(raw.as_bytes()).unwrap();
        Arc::new(req)
    }

    // Runs one request through the chain against a fresh root capture and
    // returns what would hit the wire, plus the chain result.
    async fn dispatch(
        chain: &[MiddlewareHandler],
        target: &str,
    ) -> (CachedResponse, Result<(), HandlerError>) {
        let root = Arc::new(ResponseCapture::new());
        let result = Next::new(chain.to_vec())
            .run(request(target), Arc::clone(&root) as SinkHandle)
            .await;
        root.finish();
        (root.snapshot().await, result)
    }

    fn json_cache() -> CacheMiddleware {
        CacheMiddleware::new(CacheConfig::new(".json")).unwrap()
    }

    fn counting_origin(invocations: Arc<AtomicUsize>) -> MiddlewareHandler {
        from_handler(move |_request, sink| {
            let invocations = Arc::clone(&invocations);
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                sink.set_status(StatusCode::Ok);
                sink.insert_header("X-Upstream", "origin");
                sink.write(br#"{"a":1}"#);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn miss_then_hit_serves_identical_bytes() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let cache = json_cache();
        let chain = vec![
            from_middleware(Arc::new(cache)),
            counting_origin(Arc::clone(&invocations)),
        ];

        let (first, result) = dispatch(&chain, "/data.json").await;
        assert!(result.is_ok());
        assert_eq!(first.status, StatusCode::Ok);
        assert_eq!(&first.body[..], br#"{"a":1}"#);
        assert_eq!(first.headers.get("content-type"), Some(REPLAY_CONTENT_TYPE));
        assert_eq!(
            first.headers.get("content-length"),
            Some(first.body.len().to_string().as_str())
        );

        let (second, result) = dispatch(&chain, "/data.json").await;
        assert!(result.is_ok());
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(second.status, first.status);
        assert_eq!(second.body, first.body);
    }

    #[tokio::test]
    async fn ineligible_path_passes_through_untouched() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let cache = json_cache();
        let store = Arc::clone(cache.store());
        let chain = vec![
            from_middleware(Arc::new(cache)),
            counting_origin(Arc::clone(&invocations)),
        ];

        let (snapshot, result) = dispatch(&chain, "/data.xml").await;
        assert!(result.is_ok());
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        // The origin's own output, not the replay shape.
        assert_eq!(snapshot.headers.get("x-upstream"), Some("origin"));
        assert_eq!(snapshot.headers.get("content-type"), None);
        assert!(store.is_empty());

        dispatch(&chain, "/data.xml").await;
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn query_string_is_not_part_of_the_key() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let chain = vec![
            from_middleware(Arc::new(json_cache())),
            counting_origin(Arc::clone(&invocations)),
        ];

        dispatch(&chain, "/data.json?page=1").await;
        dispatch(&chain, "/data.json?page=2").await;
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_recomputes() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let chain = vec![
            from_middleware(Arc::new(json_cache())),
            counting_origin(Arc::clone(&invocations)),
        ];

        dispatch(&chain, "/data.json").await;
        tokio::time::advance(Duration::from_secs(61)).await;
        dispatch(&chain, "/data.json").await;
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_requests_coalesce_into_one_computation() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = watch::channel(false);
        let origin = from_handler({
            let invocations = Arc::clone(&invocations);
            move |_request, sink| {
                let invocations = Arc::clone(&invocations);
                let mut release = release_rx.clone();
                async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    let _ = release.wait_for(|released| *released).await;
                    sink.set_status(StatusCode::Ok);
                    sink.write(br#"{"a":1}"#);
                    Ok(())
                }
            }
        });
        let chain = vec![from_middleware(Arc::new(json_cache())), origin];

        let first = tokio::spawn({
            let chain = chain.clone();
            async move { dispatch(&chain, "/data.json").await }
        });
        // Let the first request become the flight leader and block downstream.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = tokio::spawn({
            let chain = chain.clone();
            async move { dispatch(&chain, "/data.json").await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        release_tx.send(true).unwrap();
        let (first, first_result) = first.await.unwrap();
        let (second, second_result) = second.await.unwrap();
        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        assert!(first_result.is_ok());
        assert!(second_result.is_ok());
        assert_eq!(first.status, second.status);
        assert_eq!(first.body, second.body);
        let first_headers: Vec<_> = first.headers.iter().collect();
        let second_headers: Vec<_> = second.headers.iter().collect();
        assert_eq!(first_headers, second_headers);
    }

    #[tokio::test]
    async fn downstream_error_reaches_caller_with_captured_bytes() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let cache = json_cache();
        let store = Arc::clone(cache.store());
        let origin = from_handler({
            let invocations = Arc::clone(&invocations);
            move |_request, sink| {
                let invocations = Arc::clone(&invocations);
                async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    sink.set_status(StatusCode::BadGateway);
                    sink.write(b"upstream exploded");
                    Err(HandlerError::message("upstream exploded"))
                }
            }
        });
        let chain = vec![from_middleware(Arc::new(cache)), origin];

        let (snapshot, result) = dispatch(&chain, "/data.json").await;
        assert!(matches!(result, Err(HandlerError::Message(_))));
        // The captured bytes are still written alongside the error.
        assert_eq!(snapshot.status, StatusCode::BadGateway);
        assert_eq!(&snapshot.body[..], b"upstream exploded");
        // Failed computations are never stored.
        assert!(store.is_empty());

        let (_, result) = dispatch(&chain, "/data.json").await;
        assert!(result.is_err());
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn coalesced_waiters_observe_the_leaders_error() {
        let (release_tx, release_rx) = watch::channel(false);
        let origin = from_handler(move |_request, sink| {
            let mut release = release_rx.clone();
            async move {
                let _ = release.wait_for(|released| *released).await;
                sink.write(b"partial");
                Err(HandlerError::message("boom"))
            }
        });
        let chain = vec![from_middleware(Arc::new(json_cache())), origin];

        let first = tokio::spawn({
            let chain = chain.clone();
            async move { dispatch(&chain, "/data.json").await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = tokio::spawn({
            let chain = chain.clone();
            async move { dispatch(&chain, "/data.json").await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        release_tx.send(true).unwrap();

        let (first, first_result) = first.await.unwrap();
        let (second, second_result) = second.await.unwrap();
        assert!(first_result.is_err());
        assert!(second_result.is_err());
        assert_eq!(first.body, second.body);
    }

    #[tokio::test]
    async fn handler_without_status_is_replayed_as_not_found() {
        let chain = vec![
            from_middleware(Arc::new(json_cache())),
            from_handler(|_request, sink| async move {
                sink.write(b"{}");
                Ok(())
            }),
        ];

        let (snapshot, result) = dispatch(&chain, "/data.json").await;
        assert!(result.is_ok());
        assert_eq!(snapshot.status, StatusCode::NotFound);
    }

    #[tokio::test]
    async fn shared_store_serves_hits_across_instances() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let first = json_cache();
        let store = Arc::clone(first.store());
        let second =
            CacheMiddleware::with_store(CacheConfig::new(".json"), Arc::clone(&store)).unwrap();

        let chain_a = vec![
            from_middleware(Arc::new(first)),
            counting_origin(Arc::clone(&invocations)),
        ];
        let chain_b = vec![
            from_middleware(Arc::new(second)),
            counting_origin(Arc::clone(&invocations)),
        ];

        dispatch(&chain_a, "/data.json").await;
        dispatch(&chain_b, "/data.json").await;
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalid_configuration_is_rejected_up_front() {
        assert!(matches!(
            CacheMiddleware::new(CacheConfig::new("")),
            Err(ConfigError::EmptySuffix)
        ));
        assert!(matches!(
            CacheMiddleware::new(CacheConfig::new(".json").with_capacity(0)),
            Err(ConfigError::ZeroCapacity)
        ));
    }
}
