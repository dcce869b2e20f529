//! HTTP mode: a tiny axum app served through the reloader.

use std::time::Duration;

use axum::extract::Query;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

/// Upper bound for `/slow`, so a typo cannot hold a drain open for hours.
const MAX_SLOW_SECS: u64 = 60;

pub fn router() -> Router {
    Router::new()
        .route("/", get(hello))
        .route("/pid", get(pid))
        .route("/slow", get(slow))
}

async fn hello() -> &'static str {
    "Hello, world!\n"
}

async fn pid() -> String {
    format!("{}\n", std::process::id())
}

#[derive(Debug, Deserialize)]
struct SlowParams {
    #[serde(default = "default_slow_secs")]
    secs: u64,
}

fn default_slow_secs() -> u64 {
    5
}

/// Holds the request open to make draining observable across a restart.
async fn slow(Query(params): Query<SlowParams>) -> String {
    let secs = params.secs.min(MAX_SLOW_SECS);
    tokio::time::sleep(Duration::from_secs(secs)).await;
    format!("done after {}s in {}\n", secs, std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hello() {
        assert_eq!(hello().await, "Hello, world!\n");
    }

    #[tokio::test]
    async fn test_pid_reports_this_process() {
        assert_eq!(pid().await.trim(), std::process::id().to_string());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_is_capped() {
        let started = tokio::time::Instant::now();
        let body = slow(Query(SlowParams { secs: 3600 })).await;
        assert!(started.elapsed() >= Duration::from_secs(MAX_SLOW_SECS));
        assert!(body.starts_with("done after 60s"));
    }
}
