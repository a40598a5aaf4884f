//! Blueprints: named groups of routes mounted under a URL prefix.

use axum::routing::MethodRouter;
use axum::Router;

use crate::application::AppState;

#[derive(Clone)]
pub struct Blueprint {
    name: String,
    router: Router<AppState>,
}

impl Blueprint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            router: Router::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn route(mut self, path: &str, method_router: MethodRouter<AppState>) -> Self {
        self.router = self.router.route(path, method_router);
        self
    }

    /// Mount another blueprint's routes under `path` inside this one.
    pub fn nest(mut self, path: &str, other: Blueprint) -> Self {
        self.router = mount(self.router, path, other.router);
        self
    }

    /// Apply arbitrary router configuration, e.g. a blueprint-local layer.
    pub fn with_router(mut self, f: impl FnOnce(Router<AppState>) -> Router<AppState>) -> Self {
        self.router = f(self.router);
        self
    }

    pub fn into_router(self) -> Router<AppState> {
        self.router
    }
}

/// `"notes/"` -> `"/notes"`; `""` and `"/"` -> `""` (the root).
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

/// Nest `inner` at `prefix`, or merge it when the prefix is the root.
pub(crate) fn mount(
    router: Router<AppState>,
    prefix: &str,
    inner: Router<AppState>,
) -> Router<AppState> {
    let prefix = normalize_prefix(prefix);
    if prefix.is_empty() {
        router.merge(inner)
    } else {
        router.nest(&prefix, inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_are_normalized() {
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("/"), "");
        assert_eq!(normalize_prefix("notes"), "/notes");
        assert_eq!(normalize_prefix("/api/v1/"), "/api/v1");
    }
}
