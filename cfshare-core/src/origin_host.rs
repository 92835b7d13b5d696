use std::sync::Arc;

use async_trait::async_trait;

use crate::ratelimit::RateLimiter;
use crate::types::AccessState;
use crate::types::LogComponent;

/// The minimal callback surface an origin (reverse proxy or static file
/// server) needs from the owning session, so `proxy`/`static_origin` don't
/// depend on the session table directly.
#[async_trait]
pub trait OriginHost: Send + Sync {
    fn access(&self) -> AccessState;
    fn rate_limiter(&self) -> Arc<RateLimiter>;
    async fn record_request(&self);
    async fn record_response(&self, bytes_sent: u64, is_download: bool);
    async fn log(&self, component: LogComponent, line: String);
    /// Enqueue an asynchronous stop of the owning session (e.g. download
    /// quota reached). Fire-and-forget: the origin does not wait for the
    /// teardown to complete.
    async fn request_stop(&self, reason: &'static str);
}
