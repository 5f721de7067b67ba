//! Middleware pipeline — composable handler chain over a shared response sink.
//!
//! This module defines the core types for building an ordered middleware stack.
//! Each middleware wraps the next layer, enabling request inspection,
//! short-circuit responses, and response buffering without coupling handlers
//! to infrastructure concerns. Handlers do not return a response value; they
//! write status, headers, and body into a [`ResponseSink`] handed down the
//! chain, and return `Result<(), HandlerError>` so downstream failures can
//! travel back up independently of whatever bytes were produced.
//!
//! ## Core types
//!
//! - [`ResponseSink`] — the output seam every handler writes into.
//! - [`Middleware`] — trait implemented by all middleware.
//! - [`Next`] — cursor into the remaining middleware chain; call [`Next::run`]
//!   to advance to the next layer.
//! - [`MiddlewareHandler`] — type-erased, cheaply-cloneable middleware function.
//! - [`from_middleware`] / [`from_handler`] — adapters producing a
//!   [`MiddlewareHandler`] from a [`Middleware`] or a terminal handler function.
//! - [`LoggerMiddleware`] — built-in request logger.

use std::{future::Future, pin::Pin, sync::Arc};

use thiserror::Error;
use tokio::time::Instant;

use crate::http::{Request, StatusCode};

/// The output seam a downstream handler writes its response into.
///
/// A sink offers the three capabilities a handler expects from its output:
/// header mutation, setting a status code, and appending body bytes. There is
/// no ordering constraint between them — headers may be set before, between,
/// or after body writes.
///
/// All methods take `&self`: a sink is shared as an [`Arc`] so a handler may
/// hand it to a spawned task, and implementations synchronize internally.
pub trait ResponseSink: Send + Sync {
    /// Appends a response header. Repeated names are preserved in order.
    fn insert_header(&self, name: &str, value: &str);

    /// Sets the response status. A later call overwrites an earlier one.
    fn set_status(&self, status: StatusCode);

    /// Appends a chunk of body bytes.
    fn write(&self, chunk: &[u8]);
}

/// A shared handle to the response sink for one request.
pub type SinkHandle = Arc<dyn ResponseSink>;

/// A failure raised by a handler somewhere down the chain.
///
/// `HandlerError` is `Clone` so a single failure can be delivered verbatim to
/// every request coalesced onto one in-flight computation; non-cloneable
/// sources are held behind an [`Arc`].
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// An I/O failure, e.g. while talking to an upstream service.
    #[error("I/O error: {0}")]
    Io(#[from] Arc<std::io::Error>),

    /// A free-form failure reported by a handler.
    #[error("{0}")]
    Message(Arc<str>),
}

impl HandlerError {
    /// Creates a free-form handler error from a message.
    pub fn message(msg: impl Into<String>) -> Self {
        Self::Message(msg.into().into())
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// The boxed future every middleware and handler returns.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;

/// A type-erased, reference-counted middleware function.
///
/// Every entry in the middleware stack is stored as a `MiddlewareHandler`.
/// The [`Arc`] wrapper makes handlers cheap to clone so that [`Next`] can
/// advance through the chain without copying closures.
pub type MiddlewareHandler =
    Arc<dyn Fn(Arc<Request>, SinkHandle, Next) -> HandlerFuture + Send + Sync + 'static>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
///
/// # Arguments
///
/// - `middleware` — a reference-counted [`Middleware`] to wrap.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use cachegate::middleware::{LoggerMiddleware, from_middleware};
///
/// let handler = from_middleware(Arc::new(LoggerMiddleware));
/// ```
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |request, sink, next| middleware.handle(request, sink, next))
}

/// Converts a terminal handler function into a [`MiddlewareHandler`].
///
/// The resulting handler never advances the chain; it is meant to sit at the
/// end of the stack as "the application" the middleware in front of it wrap.
///
/// # Examples
///
/// ```rust,no_run
/// use cachegate::http::StatusCode;
/// use cachegate::middleware::{ResponseSink, from_handler};
///
/// let terminal = from_handler(|_request, sink| async move {
///     sink.set_status(StatusCode::Ok);
///     sink.write(b"hello");
///     Ok(())
/// });
/// ```
pub fn from_handler<H, F>(handler: H) -> MiddlewareHandler
where
    H: Fn(Arc<Request>, SinkHandle) -> F + Send + Sync + 'static,
    F: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |request, sink, _next| Box::pin(handler(request, sink)))
}

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is passed to each middleware's [`Middleware::handle`] implementation.
/// Calling [`Next::run`] advances the cursor by one position and invokes the
/// next middleware. `Next` is consumed on each call to [`run`](Self::run), so
/// the chain cannot be advanced more than once per middleware invocation —
/// which is exactly the "downstream is invoked 0 or 1 times" contract the
/// caching layer relies on.
pub struct Next {
    handlers: Vec<MiddlewareHandler>,
    // Tracks which handler to invoke on the next `run` call.
    index: usize,
}

impl Next {
    /// Creates a new `Next` positioned at the start of the given middleware stack.
    pub fn new(handlers: Vec<MiddlewareHandler>) -> Self {
        Self { handlers, index: 0 }
    }

    /// Invokes the next handler in the chain.
    ///
    /// Advances the internal cursor by one, clones the handler at the current
    /// position, and awaits it. If no handler remains (i.e. the chain is
    /// exhausted without anything producing a response), a
    /// `500 Internal Server Error` is written to the sink as a safe fallback.
    ///
    /// # Arguments
    ///
    /// - `request` — the request to pass to the next handler.
    /// - `sink` — the response sink the next handler writes into.
    ///
    /// # Errors
    ///
    /// Whatever error the invoked handler returns, verbatim.
    pub async fn run(mut self, request: Arc<Request>, sink: SinkHandle) -> Result<(), HandlerError> {
        if self.index < self.handlers.len() {
            let handler = self.handlers[self.index].clone();
            self.index += 1;
            handler(request, sink, self).await
        } else {
            sink.set_status(StatusCode::InternalServerError);
            sink.write(b"No response generated by handler chain");
            Ok(())
        }
    }
}

/// The core trait for all middleware.
///
/// Implementors receive the request, a shared [`SinkHandle`], and a [`Next`]
/// cursor. They may:
///
/// - **Pass through** — call `next.run(request, sink).await` unchanged.
/// - **Short-circuit** — write to the sink directly without calling `next`.
/// - **Interpose** — hand `next` a *different* sink, inspect what it wrote,
///   and then write to the real one (this is how response capture works).
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync` because middleware is shared
///   across Tokio tasks.
/// - `handle` **must** return a pinned, `Send` future so it can be awaited
///   across `.await` points in multi-threaded runtimes.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use cachegate::http::Request;
/// use cachegate::middleware::{HandlerFuture, Middleware, Next, SinkHandle};
///
/// struct PassThrough;
///
/// impl Middleware for PassThrough {
///     fn handle(&self, request: Arc<Request>, sink: SinkHandle, next: Next) -> HandlerFuture {
///         Box::pin(async move { next.run(request, sink).await })
///     }
/// }
/// ```
pub trait Middleware: Send + Sync {
    /// Handle the request and optionally delegate to the next middleware.
    fn handle(&self, request: Arc<Request>, sink: SinkHandle, next: Next) -> HandlerFuture;
}

/// Built-in middleware that logs each request's method, path, duration, and outcome.
///
/// Emits a single `tracing::info!` (or `warn!` on failure) line after the
/// downstream handler completes. `LoggerMiddleware` never short-circuits.
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, request: Arc<Request>, sink: SinkHandle, next: Next) -> HandlerFuture {
        Box::pin(async move {
            let start = Instant::now();
            let method = request.method().as_str().to_owned();
            let path = request.path().to_owned();

            let result = next.run(request, sink).await;

            let duration = start.elapsed();
            match &result {
                Ok(()) => tracing::info!("{} {} ({:?})", method, path, duration),
                Err(e) => tracing::warn!("{} {} failed: {} ({:?})", method, path, e, duration),
            }

            result
        })
    }
}
