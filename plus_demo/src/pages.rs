use axum::extract::State;
use axum::response::Html;
use axum::routing::get;
use axum::Json;
use axumplus::application::AppState;
use axumplus::templates::html_escape;
use axumplus::Blueprint;
use serde_json::{json, Value};

pub fn blueprint() -> Blueprint {
    Blueprint::new("pages")
        .route("/", get(index))
        .route("/health", get(health))
}

async fn index(State(state): State<AppState>) -> Html<String> {
    let tables: Vec<String> = state
        .models
        .tables()
        .iter()
        .map(|t| format!("<li>{}</li>", html_escape(&t.name)))
        .collect();
    Html(format!(
        "<!doctype html>\n<html>\n<head><title>Notes</title></head>\n<body>\n<h1>Notes</h1>\n<p>JSON API under <a href=\"/notes\">/notes</a>.</p>\n<ul>\n{}\n</ul>\n</body>\n</html>\n",
        tables.join("\n")
    ))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
