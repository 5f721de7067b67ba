//! Buffered response capture with a one-shot completion signal.
//!
//! A capture stands in for the real output while a downstream handler runs:
//! status, headers, and body land in an internal buffer instead of being
//! forwarded. The owner must not read any of it until the handler is done,
//! and "done" is signalled by [`ResponseCapture::finish`] — fired
//! unconditionally when the downstream call returns, never inferred from a
//! status write (a handler that never sets a status must not strand the
//! reader).

use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use tokio::sync::watch;

use crate::http::{Headers, StatusCode};
use crate::middleware::ResponseSink;

use super::store::CachedResponse;

// Everything the downstream handler produces, while it is still mutable.
#[derive(Debug)]
struct CaptureState {
    status: Option<StatusCode>,
    headers: Headers,
    body: BytesMut,
}

/// A response sink that buffers everything a downstream handler writes.
///
/// Shared as an `Arc`: the handler side writes through the [`ResponseSink`]
/// impl, the owning side calls [`finish`](Self::finish) once the handler's
/// top-level call has returned and then takes the one snapshot via
/// [`snapshot`](Self::snapshot).
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use cachegate::cache::ResponseCapture;
/// use cachegate::http::StatusCode;
/// use cachegate::middleware::ResponseSink;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let capture = Arc::new(ResponseCapture::new());
/// capture.set_status(StatusCode::Ok);
/// capture.write(b"hello");
/// capture.finish();
///
/// let snapshot = capture.snapshot().await;
/// assert_eq!(snapshot.status, StatusCode::Ok);
/// assert_eq!(&snapshot.body[..], b"hello");
/// # }
/// ```
pub struct ResponseCapture {
    state: Mutex<CaptureState>,
    done: watch::Sender<bool>,
}

impl ResponseCapture {
    /// Creates an empty capture: no status, no headers, no body.
    pub fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self {
            state: Mutex::new(CaptureState {
                status: None,
                headers: Headers::new(),
                body: BytesMut::new(),
            }),
            done,
        }
    }

    fn state(&self) -> MutexGuard<'_, CaptureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fires the completion signal.
    ///
    /// Call this when the downstream handler's top-level call returns —
    /// success or failure, status set or not. Idempotent: the signal is
    /// single-assignment and later calls change nothing.
    pub fn finish(&self) {
        self.done.send_replace(true);
    }

    /// Waits for [`finish`](Self::finish), then snapshots the capture into an
    /// immutable [`CachedResponse`].
    ///
    /// The snapshot clones the headers and copies the body; a status the
    /// handler never set defaults to `404 Not Found`.
    pub async fn snapshot(&self) -> CachedResponse {
        let mut done = self.done.subscribe();
        // The sender lives inside `self`, so the channel cannot close before
        // the signal fires.
        let _ = done.wait_for(|done| *done).await;

        let state = self.state();
        CachedResponse {
            status: state.status.unwrap_or(StatusCode::NotFound),
            headers: state.headers.clone(),
            body: Bytes::copy_from_slice(&state.body),
        }
    }
}

impl Default for ResponseCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseSink for ResponseCapture {
    fn insert_header(&self, name: &str, value: &str) {
        self.state().headers.insert(name, value);
    }

    fn set_status(&self, status: StatusCode) {
        self.state().status = Some(status);
    }

    fn write(&self, chunk: &[u8]) {
        self.state().body.extend_from_slice(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn captures_status_headers_and_body() {
        let capture = ResponseCapture::new();
        capture.set_status(StatusCode::Created);
        capture.insert_header("X-One", "1");
        capture.insert_header("X-One", "2");
        capture.write(b"hello ");
        capture.write(b"world");
        capture.finish();

        let snapshot = capture.snapshot().await;
        assert_eq!(snapshot.status, StatusCode::Created);
        assert_eq!(&snapshot.body[..], b"hello world");
        assert_eq!(snapshot.body_len(), 11);
        let values: Vec<_> = snapshot.headers.get_all("x-one").collect();
        assert_eq!(values, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn missing_status_defaults_to_not_found() {
        let capture = ResponseCapture::new();
        capture.write(b"body without a status");
        capture.finish();

        let snapshot = capture.snapshot().await;
        assert_eq!(snapshot.status, StatusCode::NotFound);
    }

    #[tokio::test]
    async fn later_status_overwrites_earlier() {
        let capture = ResponseCapture::new();
        capture.set_status(StatusCode::Ok);
        capture.set_status(StatusCode::NoContent);
        capture.finish();

        assert_eq!(capture.snapshot().await.status, StatusCode::NoContent);
    }

    #[tokio::test]
    async fn snapshot_waits_for_finish() {
        let capture = Arc::new(ResponseCapture::new());
        let finished = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn({
            let capture = Arc::clone(&capture);
            let finished = Arc::clone(&finished);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                capture.set_status(StatusCode::Ok);
                capture.write(b"late");
                finished.store(true, Ordering::SeqCst);
                capture.finish();
            }
        });

        let snapshot = capture.snapshot().await;
        // The snapshot only resolved after the writer signalled completion.
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(&snapshot.body[..], b"late");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn finish_is_idempotent() {
        let capture = ResponseCapture::new();
        capture.write(b"x");
        capture.finish();
        capture.finish();
        assert_eq!(&capture.snapshot().await.body[..], b"x");
    }
}
