//! Application handlers
//!
//! Handlers are registered at startup in an explicit table keyed by path
//! pattern, relative to the application prefix. A pattern segment written as
//! `{name}` captures that segment. A handler's reply is published to the topic
//! it declares, with captured values substituted.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

/// Handler failures, reported to the sender as an ERROR frame
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid route pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("{0}")]
    Failed(String),
}

/// What a handler sees besides the body
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub session_id: String,
    /// Full destination of the SEND frame
    pub destination: String,
    /// Values captured by `{name}` segments
    pub path_vars: HashMap<String, String>,
    pub headers: Vec<(String, String)>,
}

impl HandlerContext {
    pub fn var(&self, name: &str) -> Option<&str> {
        self.path_vars.get(name).map(String::as_str)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Message a handler wants published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

impl Reply {
    pub fn new(body: impl Into<Vec<u8>>, content_type: Option<String>) -> Self {
        Self {
            body: body.into(),
            content_type,
        }
    }

    pub fn json<T: Serialize>(value: &T) -> Result<Self, HandlerError> {
        Ok(Self {
            body: serde_json::to_vec(value)?,
            content_type: Some("application/json".to_string()),
        })
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one SEND. `Ok(None)` publishes nothing.
    async fn handle(&self, ctx: HandlerContext, body: Vec<u8>) -> Result<Option<Reply>, HandlerError>;
}

/// Adapter for async closures
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(HandlerContext, Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<Reply>, HandlerError>> + Send,
{
    async fn handle(&self, ctx: HandlerContext, body: Vec<u8>) -> Result<Option<Reply>, HandlerError> {
        (self.0)(ctx, body).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Var(String),
}

/// `/sendMessage/{roomId}` style path pattern
#[derive(Debug, Clone)]
pub struct RoutePattern {
    raw: String,
    segments: Vec<Segment>,
}

impl RoutePattern {
    pub fn parse(pattern: &str) -> Result<Self, HandlerError> {
        let invalid = |reason: &str| HandlerError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        let rest = pattern
            .strip_prefix('/')
            .ok_or_else(|| invalid("must start with '/'"))?;

        let mut segments = Vec::new();
        for part in rest.split('/') {
            if part.is_empty() {
                return Err(invalid("empty segment"));
            }
            let segment = match part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                Some(name) if name.is_empty() => return Err(invalid("unnamed variable")),
                Some(name) => Segment::Var(name.to_string()),
                None => Segment::Literal(part.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn has_var(&self, name: &str) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Var(v) if v == name))
    }

    /// Captured variables when `path` matches
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let parts: Vec<&str> = path.strip_prefix('/')?.split('/').collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut vars = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(literal) if literal == part => {}
                Segment::Var(name) if !part.is_empty() => {
                    vars.insert(name.clone(), part.to_string());
                }
                _ => return None,
            }
        }
        Some(vars)
    }
}

/// Substitute `{name}` placeholders in a topic template
fn render_topic(template: &str, vars: &HashMap<String, String>) -> String {
    vars.iter().fold(template.to_string(), |topic, (name, value)| {
        topic.replace(&format!("{{{}}}", name), value)
    })
}

fn template_vars(template: &str) -> Vec<&str> {
    template
        .split('/')
        .filter_map(|part| part.strip_prefix('{').and_then(|p| p.strip_suffix('}')))
        .collect()
}

struct Route {
    pattern: RoutePattern,
    send_to: Option<String>,
    handler: Arc<dyn MessageHandler>,
}

/// A matched route
pub struct Resolved {
    pub pattern: String,
    pub handler: Arc<dyn MessageHandler>,
    pub path_vars: HashMap<String, String>,
    /// Declared topic with variables substituted
    pub send_to: Option<String>,
}

/// Dispatch table from application paths to handlers
#[derive(Default)]
pub struct HandlerRegistry {
    routes: Vec<Route>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.routes.iter().map(|r| r.pattern.as_str()))
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `pattern`. Earlier registrations win when
    /// several patterns match.
    pub fn route<H>(mut self, pattern: &str, send_to: Option<&str>, handler: H) -> Result<Self, HandlerError>
    where
        H: MessageHandler + 'static,
    {
        let pattern = RoutePattern::parse(pattern)?;
        if let Some(template) = send_to {
            if let Some(missing) = template_vars(template).into_iter().find(|v| !pattern.has_var(v)) {
                return Err(HandlerError::InvalidPattern {
                    pattern: template.to_string(),
                    reason: format!("variable {{{}}} is not captured by {}", missing, pattern.as_str()),
                });
            }
        }

        self.routes.push(Route {
            pattern,
            send_to: send_to.map(str::to_string),
            handler: Arc::new(handler),
        });
        Ok(self)
    }

    /// Register an async closure
    pub fn route_fn<F, Fut>(self, pattern: &str, send_to: Option<&str>, f: F) -> Result<Self, HandlerError>
    where
        F: Fn(HandlerContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Reply>, HandlerError>> + Send + 'static,
    {
        self.route(pattern, send_to, FnHandler(f))
    }

    /// Handler for a path relative to the application prefix
    pub fn resolve(&self, path: &str) -> Option<Resolved> {
        self.routes.iter().find_map(|route| {
            let path_vars = route.pattern.matches(path)?;
            Some(Resolved {
                pattern: route.pattern.as_str().to_string(),
                handler: Arc::clone(&route.handler),
                send_to: route.send_to.as_deref().map(|t| render_topic(t, &path_vars)),
                path_vars,
            })
        })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
