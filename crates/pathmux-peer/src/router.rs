//! Path routing for inbound requests
//!
//! Routes are either exact (`route`) or prefix mounts (`mount`). An
//! exact match always wins; among mounts the longest prefix matching
//! on a segment boundary wins.

use std::collections::HashMap;
use std::error::Error;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::responder::{Request, Responder};

/// Errors a route handler may bubble up. The peer logs them and, when
/// possible, turns them into a 500 reply.
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// A handler for requests addressed at or under a path.
#[async_trait]
pub trait RouteHandler: Send + Sync {
    async fn handle(&self, request: Request, responder: Responder) -> Result<(), HandlerError>;
}

/// Maps target paths to handlers.
#[derive(Default)]
pub struct Router {
    routes: HashMap<String, Arc<dyn RouteHandler>>,
    mounts: Vec<(String, Arc<dyn RouteHandler>)>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for exactly `path`.
    pub fn route(mut self, path: impl Into<String>, handler: impl RouteHandler + 'static) -> Self {
        self.routes.insert(path.into(), Arc::new(handler));
        self
    }

    /// Registers a handler for `prefix` and every path below it.
    pub fn mount(mut self, prefix: impl Into<String>, handler: impl RouteHandler + 'static) -> Self {
        self.mounts.push((prefix.into(), Arc::new(handler)));
        self
    }

    pub fn lookup(&self, path: &str) -> Option<Arc<dyn RouteHandler>> {
        if let Some(handler) = self.routes.get(path) {
            return Some(handler.clone());
        }
        self.mounts
            .iter()
            .filter(|(prefix, _)| prefix_matches(prefix, path))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, handler)| handler.clone())
    }
}

/// A mount at `/a` covers `/a` and `/a/b`, never `/ab`.
fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

/// Wraps an async closure as a [`RouteHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Request, Responder) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler(f)
}

pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> RouteHandler for FnHandler<F>
where
    F: Fn(Request, Responder) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, request: Request, responder: Responder) -> Result<(), HandlerError> {
        (self.0)(request, responder).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> FnHandler<impl Fn(Request, Responder) -> std::future::Ready<Result<(), HandlerError>> + Send + Sync>
    {
        handler_fn(|_request, _responder| std::future::ready(Ok::<_, HandlerError>(())))
    }

    #[test]
    fn test_exact_route_wins_over_mount() {
        let router = Router::new().mount("/api", noop()).route("/api/users", noop());
        assert!(router.lookup("/api/users").is_some());
        assert!(router.lookup("/api/other").is_some());
        assert!(router.lookup("/unrelated").is_none());
    }

    #[test]
    fn test_longest_mount_prefix_wins() {
        let router = Router::new().mount("/", noop()).mount("/api/v2", noop());
        assert!(router.lookup("/api/v2/users").is_some());
        assert!(router.lookup("/anything").is_some());
    }

    #[test]
    fn test_mount_respects_segment_boundaries() {
        let router = Router::new().mount("/api", noop());
        assert!(router.lookup("/api").is_some());
        assert!(router.lookup("/api/users").is_some());
        assert!(router.lookup("/apiary").is_none());
    }
}
