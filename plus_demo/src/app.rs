use std::path::Path;

use axumplus::Application;

use crate::models::{Note, Tag};
use crate::{notes, pages};

pub const APP_NAME: &str = "notes";

/// The notes service. Settings are read from `<root>/settings.toml`.
pub fn application(root: impl AsRef<Path>) -> Application {
    Application::new(APP_NAME, root.as_ref())
        .blueprint("/", pages::blueprint())
        .blueprint("/notes", notes::blueprint())
        .model::<Tag>()
        .model::<Note>()
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use axum::Router;
    use axumplus::SettingsPath;
    use tower::ServiceExt;

    fn router() -> Router {
        application(env!("CARGO_MANIFEST_DIR"))
            .settings_override(SettingsPath::new("settings.toml", "testing"))
            .create_app()
            .unwrap()
            .router()
    }

    async fn send(request: Request<Body>) -> (StatusCode, String) {
        let response = router().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_and_index() {
        let (status, body) = send(get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"status":"ok"}"#);

        let (status, body) = send(get("/")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("<li>tags</li>\n<li>notes</li>"));
    }

    #[tokio::test]
    async fn missing_page_uses_template() {
        let (status, body) = send(get("/nowhere")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("<title>Page not found</title>"));
        assert!(body.contains("404 Not Found: The requested URL was not found"));
    }

    #[tokio::test]
    async fn missing_page_for_xhr_is_json() {
        let request = Request::builder()
            .uri("/nowhere")
            .header("x-requested-with", "XMLHttpRequest")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, r#"{"error":"Sorry, page not found"}"#);
    }

    #[tokio::test]
    async fn malformed_note_is_rejected_before_the_database() {
        let request = Request::builder()
            .method("POST")
            .uri("/notes")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"body":"no title"}"#))
            .unwrap();
        let (status, _) = send(request).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }
}
