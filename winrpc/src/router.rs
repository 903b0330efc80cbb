//! Path pattern compilation, route table, and middleware chain (§4.10).
//!
//! Patterns are compiled into segment lists rather than real regular
//! expressions: a `:name` segment captures the corresponding request
//! segment, anything else must match literally. This keeps route matching
//! dependency-free and is equivalent in power to what `:param`-style routing
//! needs.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::request::ServerRequest;
use crate::response::ServerResponse;
use winrpc_core::RpcError;

pub type Params = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

fn compile(pattern: &str) -> Vec<Segment> {
    pattern
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| match segment.strip_prefix(':') {
            Some(name) => Segment::Param(name.to_string()),
            None => Segment::Literal(segment.to_string()),
        })
        .collect()
}

fn matches(segments: &[Segment], path: &str) -> Option<Params> {
    let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if path_segments.len() != segments.len() {
        return None;
    }
    let mut params = Params::new();
    for (pattern_segment, actual) in segments.iter().zip(path_segments.iter()) {
        match pattern_segment {
            Segment::Literal(literal) => {
                if literal != actual {
                    return None;
                }
            }
            Segment::Param(name) => {
                params.insert(name.clone(), actual.to_string());
            }
        }
    }
    Some(params)
}

pub type Handler = Arc<
    dyn Fn(ServerRequest, ServerResponse) -> futures_core::future::BoxFuture<'static, Result<(), RpcError>>
        + Send
        + Sync,
>;

struct Route {
    pattern: String,
    segments: Vec<Segment>,
    is_literal: bool,
    handler: Handler,
}

pub type MiddlewareHandler = Arc<
    dyn Fn(
            ServerRequest,
            ServerResponse,
            Next,
        ) -> futures_core::future::BoxFuture<'static, Result<(), RpcError>>
        + Send
        + Sync,
>;

/// Invoked by a middleware to continue the chain. A middleware that never
/// calls this (and never sends a response) leaves the request pending,
/// which is permissible and will eventually hit the async/response timeout
/// on the client.
#[derive(Clone)]
pub struct Next {
    pub(crate) remaining: Arc<[MiddlewareEntry]>,
    pub(crate) index: usize,
    pub(crate) route_dispatch: Arc<dyn Fn(ServerRequest, ServerResponse) -> futures_core::future::BoxFuture<'static, Result<(), RpcError>> + Send + Sync>,
}

impl Next {
    pub fn call(self, req: ServerRequest, res: ServerResponse) -> futures_core::future::BoxFuture<'static, Result<(), RpcError>> {
        Box::pin(async move {
            if self.index >= self.remaining.len() {
                return (self.route_dispatch)(req, res).await;
            }
            let entry = self.remaining[self.index].clone();
            if !entry.applies(&req.path) {
                let next = Next { remaining: self.remaining, index: self.index + 1, route_dispatch: self.route_dispatch };
                return next.call(req, res).await;
            }
            let next = Next { remaining: self.remaining, index: self.index + 1, route_dispatch: self.route_dispatch };
            (entry.handler)(req, res, next).await
        })
    }
}

#[derive(Clone)]
pub struct MiddlewareEntry {
    prefix: Option<String>,
    handler: MiddlewareHandler,
}

impl MiddlewareEntry {
    fn applies(&self, path: &str) -> bool {
        match &self.prefix {
            None => true,
            Some(prefix) => path == prefix || path.starts_with(&format!("{prefix}/")),
        }
    }
}

/// Route table plus ordered middleware chain for one server endpoint.
pub struct Router {
    routes: RwLock<Vec<Route>>,
    middleware: RwLock<Vec<MiddlewareEntry>>,
}

impl Default for Router {
    fn default() -> Self {
        Self {
            routes: RwLock::new(Vec::new()),
            middleware: RwLock::new(Vec::new()),
        }
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `pattern`. Last registration for an
    /// identical literal pattern string replaces the prior one.
    pub fn route(&self, pattern: impl Into<String>, handler: Handler) {
        let pattern = pattern.into();
        let segments = compile(&pattern);
        let is_literal = segments.iter().all(|s| matches!(s, Segment::Literal(_)));
        let mut routes = self.routes.write();
        if let Some(existing) = routes.iter_mut().find(|r| r.pattern == pattern) {
            existing.handler = handler;
            return;
        }
        routes.push(Route { pattern, segments, is_literal, handler });
    }

    pub fn use_middleware(&self, prefix: Option<String>, handler: MiddlewareHandler) {
        self.middleware.write().push(MiddlewareEntry { prefix, handler });
    }

    /// First exact-match registration wins; otherwise the first pattern
    /// match at dispatch time.
    fn find(&self, path: &str) -> Option<(Handler, Params)> {
        let routes = self.routes.read();
        if let Some(route) = routes.iter().find(|r| r.is_literal && r.pattern == path) {
            return Some((route.handler.clone(), Params::new()));
        }
        for route in routes.iter().filter(|r| !r.is_literal) {
            if let Some(params) = matches(&route.segments, path) {
                return Some((route.handler.clone(), params));
            }
        }
        None
    }

    /// Runs the middleware chain followed by route dispatch (or
    /// `METHOD_NOT_FOUND` if nothing matches).
    pub async fn dispatch(&self, mut req: ServerRequest, res: ServerResponse) -> Result<(), RpcError> {
        let (handler, params) = match self.find(&req.path) {
            Some(found) => (Some(found.0), found.1),
            None => (None, Params::new()),
        };
        req.params = params;

        let middleware: Arc<[MiddlewareEntry]> = self.middleware.read().clone().into();
        let route_dispatch: Arc<dyn Fn(ServerRequest, ServerResponse) -> futures_core::future::BoxFuture<'static, Result<(), RpcError>> + Send + Sync> =
            Arc::new(move |req: ServerRequest, res: ServerResponse| {
                let handler = handler.clone();
                Box::pin(async move {
                    match handler {
                        Some(handler) => handler(req, res).await,
                        None => {
                            res.not_found();
                            Ok(())
                        }
                    }
                })
            });

        let next = Next { remaining: middleware, index: 0, route_dispatch };
        next.call(req, res).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_pattern_matches_exactly() {
        let segments = compile("/api/health");
        assert_eq!(matches(&segments, "/api/health"), Some(Params::new()));
        assert_eq!(matches(&segments, "/api/health/x"), None);
    }

    #[test]
    fn param_segment_captures_value() {
        let segments = compile("/api/users/:id");
        let params = matches(&segments, "/api/users/42").unwrap();
        assert_eq!(params.get("id"), Some(&"42".to_string()));
    }

    #[test]
    fn middleware_prefix_matching() {
        let entry = MiddlewareEntry { prefix: Some("/api".to_string()), handler: Arc::new(|_, _, _| Box::pin(async { Ok(()) })) };
        assert!(entry.applies("/api"));
        assert!(entry.applies("/api/users"));
        assert!(!entry.applies("/apiother"));
    }
}
