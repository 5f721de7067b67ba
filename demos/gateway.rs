//! A caching gateway in front of a deliberately slow JSON handler.
//!
//! Run with `cargo run --example gateway`, then poke it:
//!
//! ```text
//! curl -i http://127.0.0.1:8080/report.json   # first hit: ~750 ms
//! curl -i http://127.0.0.1:8080/report.json   # repeat within 30 s: instant
//! curl -i http://127.0.0.1:8080/index.html    # never cached
//! ```
//!
//! Fire several concurrent requests at the same uncached path to watch them
//! coalesce into a single downstream computation.

use std::sync::Arc;
use std::time::Duration;

use cachegate::cache::{CacheConfig, CacheMiddleware};
use cachegate::http::StatusCode;
use cachegate::middleware::{LoggerMiddleware, ResponseSink, from_handler, from_middleware};
use cachegate::server::Server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,cachegate=debug".into()),
        )
        .init();

    let cache = CacheMiddleware::new(
        CacheConfig::new(".json")
            .with_capacity(1024)
            .with_ttl(Duration::from_secs(30)),
    )?;
    // Sweep expired entries off the request path once a minute.
    let _sweeper = cache.store().spawn_sweeper(Duration::from_secs(60));

    let upstream = from_handler(|request, sink| async move {
        // Pretend this is an expensive aggregation.
        tokio::time::sleep(Duration::from_millis(750)).await;
        let body = serde_json::json!({
            "path": request.path(),
            "generated_in_ms": 750,
        })
        .to_string();
        sink.set_status(StatusCode::Ok);
        sink.write(body.as_bytes());
        Ok(())
    });

    let server = Server::bind("127.0.0.1:8080").await?;
    println!("gateway on http://{}", server.local_addr());
    server
        .run(vec![
            from_middleware(Arc::new(LoggerMiddleware)),
            from_middleware(Arc::new(cache)),
            upstream,
        ])
        .await?;
    Ok(())
}
