//! Request routing: which strategy and partition serve a request.

use serde::{Deserialize, Serialize};

use crate::partition::Purpose;
use crate::request::RequestDescriptor;
use crate::strategy::Strategy;

/// Predicate over a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RouteMatcher {
    /// Top-level navigations.
    Navigation,
    /// URL path starts with `prefix`.
    PathPrefix { prefix: String },
    /// URL path ends in one of `extensions` (without the dot, case-insensitive).
    Extension { extensions: Vec<String> },
    /// URL host equals `host`.
    Host { host: String },
    /// Every request.
    Any,
}

impl RouteMatcher {
    pub fn matches(&self, request: &RequestDescriptor) -> bool {
        let url = &request.url;
        match self {
            RouteMatcher::Navigation => request.is_navigation(),
            RouteMatcher::PathPrefix { prefix } => url.path().starts_with(prefix.as_str()),
            RouteMatcher::Extension { extensions } => {
                let file = url.path().rsplit('/').next().unwrap_or_default();
                match file.rsplit_once('.') {
                    Some((_, ext)) => extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)),
                    None => false,
                }
            }
            RouteMatcher::Host { host } => url.host_str() == Some(host.as_str()),
            RouteMatcher::Any => true,
        }
    }
}

/// One routing rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    #[serde(rename = "match")]
    pub matcher: RouteMatcher,
    pub strategy: Strategy,
    pub purpose: Purpose,
}

impl Route {
    pub fn new(matcher: RouteMatcher, strategy: Strategy, purpose: impl Into<Purpose>) -> Self {
        Self {
            matcher,
            strategy,
            purpose: purpose.into(),
        }
    }
}

/// Ordered routing rules; the first match wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    pub fn push(&mut self, route: Route) {
        self.routes.push(route);
    }

    /// The first route matching `request`. `None` means the request goes to
    /// the network without touching the cache.
    pub fn resolve(&self, request: &RequestDescriptor) -> Option<&Route> {
        self.routes.iter().find(|route| route.matcher.matches(request))
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
