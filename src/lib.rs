//! # cachegate
//!
//! A response-caching, request-coalescing HTTP gateway layer on a
//! from-scratch async HTTP/1.1 server.
//!
//! Requests whose path ends with a configured suffix are served from a
//! bounded, TTL-limited in-memory LRU cache; concurrent requests for the
//! same uncached path trigger exactly one downstream computation, whose
//! result is shared byte-for-byte by every coalesced caller. Everything else
//! passes through to the downstream handler untouched.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cachegate::cache::{CacheConfig, CacheMiddleware};
//! use cachegate::http::StatusCode;
//! use cachegate::middleware::{ResponseSink, from_handler, from_middleware};
//! use cachegate::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cache = CacheMiddleware::new(CacheConfig::new(".json"))?;
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     println!("Listening on http://127.0.0.1:8080");
//!     server
//!         .run(vec![
//!             from_middleware(Arc::new(cache)),
//!             from_handler(|_request, sink| async move {
//!                 sink.set_status(StatusCode::Ok);
//!                 sink.write(br#"{"a":1}"#);
//!                 Ok(())
//!             }),
//!         ])
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod background;
pub mod cache;
pub mod http;
pub mod middleware;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{CacheConfig, CacheMiddleware, CacheStore, CachedResponse, ConfigError};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use middleware::{HandlerError, Middleware, Next, ResponseSink};
pub use server::{Server, ServerError};
