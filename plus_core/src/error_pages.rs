//! Error pages for 403, 404 and 500.
//!
//! Handlers abort with [`HttpError`]; unmatched routes and panics map to it
//! as well. Outside debug mode the middleware in this module replaces those
//! responses with a JSON body for XHR callers or a rendered
//! `errors/<code>.html` template for everyone else. Responses a handler
//! builds itself, even with the same status, pass through untouched.

use std::any::Any;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{Html, IntoResponse, Response};
use axum::Json;

use crate::templates::Templates;

/// An aborted request. Carried in the response extensions so the error
/// page middleware can recognise it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HttpError {
    #[error("Not Found")]
    NotFound,
    #[error("Forbidden")]
    Forbidden,
    #[error("Internal Server Error")]
    Internal,
}

impl HttpError {
    pub fn status(self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Body of the `error` field returned to XHR callers.
    pub fn xhr_message(self) -> &'static str {
        match self {
            Self::NotFound => "Sorry, page not found",
            Self::Forbidden => "Sorry, not allowed",
            Self::Internal => "Sorry, an error has occurred",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::NotFound => {
                "The requested URL was not found on the server. If you entered the URL \
                 manually please check your spelling and try again."
            }
            Self::Forbidden => {
                "You don't have the permission to access the requested resource. It is \
                 either read-protected or not readable by the server."
            }
            Self::Internal => {
                "The server encountered an internal error and was unable to complete your \
                 request. Either the server is overloaded or there is an error in the \
                 application."
            }
        }
    }

    /// `404 Not Found: The requested URL ...`
    pub fn detail(self) -> String {
        format!("{} {}: {}", self.status().as_u16(), self, self.description())
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let mut response = (self.status(), self.detail()).into_response();
        response.extensions_mut().insert(self);
        response
    }
}

impl From<crate::Error> for HttpError {
    fn from(e: crate::Error) -> Self {
        match e {
            crate::Error::Query(diesel::result::Error::NotFound) => Self::NotFound,
            e => {
                tracing::error!("Request failed: {e}");
                Self::Internal
            }
        }
    }
}

impl From<diesel::result::Error> for HttpError {
    fn from(e: diesel::result::Error) -> Self {
        crate::Error::Query(e).into()
    }
}

pub fn is_xhr(headers: &HeaderMap) -> bool {
    headers
        .get("x-requested-with")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("XMLHttpRequest"))
}

/// State of the error page middleware.
#[derive(Clone, Debug)]
pub struct ErrorPages {
    templates: Templates,
}

impl ErrorPages {
    pub fn new(templates: Templates) -> Self {
        Self { templates }
    }

    pub async fn render(&self, error: HttpError, xhr: bool) -> Response {
        if xhr {
            return (
                error.status(),
                Json(serde_json::json!({ "error": error.xhr_message() })),
            )
                .into_response();
        }

        let name = format!("errors/{}.html", error.status().as_u16());
        let data = serde_json::json!({ "error": error.detail() });
        let html = match self.templates.render(&name, &data) {
            Ok(Some(html)) => html,
            Ok(None) => builtin_page(error),
            Err(e) => {
                tracing::warn!("Failed to render {name}: {e}");
                builtin_page(error)
            }
        };
        (error.status(), Html(html)).into_response()
    }
}

fn builtin_page(error: HttpError) -> String {
    format!(
        "<!doctype html>\n<html>\n<head><title>{code} {title}</title></head>\n<body>\n<h1>{title}</h1>\n<p>{description}</p>\n</body>\n</html>\n",
        code = error.status().as_u16(),
        title = error,
        description = error.description(),
    )
}

/// Middleware replacing [`HttpError`] responses with error pages.
pub async fn render_error_pages(
    State(pages): State<ErrorPages>,
    request: Request,
    next: Next,
) -> Response {
    let xhr = is_xhr(request.headers());
    let response = next.run(request).await;

    match response.extensions().get::<HttpError>().copied() {
        Some(error) => pages.render(error, xhr).await,
        None => response,
    }
}

/// Fallback for unmatched routes.
pub async fn not_found() -> HttpError {
    HttpError::NotFound
}

/// Response for a handler that panicked.
pub fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let message = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(panic = %message, "Handler panicked");
    HttpError::Internal.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::http::{header, Request};
    use axum::routing::get;
    use axum::{middleware, Router};
    use tower::ServiceExt;
    use tower_http::catch_panic::CatchPanicLayer;

    async fn boom() -> &'static str {
        panic!("kaboom")
    }

    fn router(templates: Templates) -> Router {
        Router::new()
            .route("/forbidden", get(|| async { HttpError::Forbidden }))
            .route("/teapot", get(|| async { (StatusCode::NOT_FOUND, "custom") }))
            .route("/boom", get(boom))
            .fallback(not_found)
            .layer(CatchPanicLayer::custom(panic_response))
            .layer(middleware::from_fn_with_state(
                ErrorPages::new(templates),
                render_error_pages,
            ))
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn request(uri: &str, xhr: bool) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if xhr {
            builder = builder.header("X-Requested-With", "XMLHttpRequest");
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn xhr_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_xhr(&headers));
        headers.insert("x-requested-with", "xmlhttprequest".parse().unwrap());
        assert!(is_xhr(&headers));
    }

    #[tokio::test]
    async fn unmatched_route_xhr_gets_json() {
        let dir = tempfile::tempdir().unwrap();
        let response = router(Templates::load(dir.path()).unwrap())
            .oneshot(request("/nowhere", true))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["error"], "Sorry, page not found");
    }

    #[tokio::test]
    async fn template_is_rendered_with_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("errors")).unwrap();
        std::fs::write(
            dir.path().join("errors/403.html"),
            "<h1>No</h1><p>{{ error }}</p>",
        )
        .unwrap();

        let response = router(Templates::load(dir.path()).unwrap())
            .oneshot(request("/forbidden", false))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/html"));
        let body = body_string(response).await;
        assert!(body.starts_with("<h1>No</h1><p>403 Forbidden: You don&#x27;t have"));
    }

    #[tokio::test]
    async fn missing_template_uses_builtin_page() {
        let dir = tempfile::tempdir().unwrap();
        let response = router(Templates::load(dir.path()).unwrap())
            .oneshot(request("/nowhere", false))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_string(response).await.contains("<h1>Not Found</h1>"));
    }

    #[tokio::test]
    async fn panic_becomes_500_page() {
        let dir = tempfile::tempdir().unwrap();
        let response = router(Templates::load(dir.path()).unwrap())
            .oneshot(request("/boom", true))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["error"], "Sorry, an error has occurred");
    }

    #[tokio::test]
    async fn explicit_responses_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let response = router(Templates::load(dir.path()).unwrap())
            .oneshot(request("/teapot", true))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_string(response).await, "custom");
    }

    #[test]
    fn diesel_not_found_maps_to_404() {
        assert_eq!(
            HttpError::from(diesel::result::Error::NotFound),
            HttpError::NotFound
        );
        assert_eq!(
            HttpError::from(crate::Error::Pool("down".into())),
            HttpError::Internal
        );
    }
}
