use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
};

use crate::auth::{self, AuthUser};
use crate::state::SharedState;
use crate::{notify, oauth, realtime, records};

// ── Custom endpoints ───────────────────────────────────────────

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn version(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({ "version": state.settings.version }))
}

async fn hello(_auth: AuthUser) -> &'static str {
    "Hello world!"
}

// ── Router ─────────────────────────────────────────────────────

pub fn router(state: SharedState) -> Router {
    let static_dir = ServeDir::new(&state.settings.static_dir).append_index_html_on_directories(true);

    Router::new()
        // Auth
        .route("/api/collections/users/auth-with-password", post(auth::auth_with_password))
        .route("/api/collections/users/auth-refresh", post(auth::auth_refresh))
        .route("/api/auth/mattermost/login", get(oauth::mattermost_login))
        .route("/api/auth/mattermost/callback", get(oauth::mattermost_callback))
        .route("/api/auth/exchange", post(oauth::exchange))
        // Collections
        .route(
            "/api/collections/:collection/records",
            get(records::list).post(records::create),
        )
        .route(
            "/api/collections/:collection/records/:id",
            get(records::view).patch(records::update).delete(records::delete),
        )
        // Realtime
        .route("/api/realtime", get(realtime::realtime_handler))
        // Mattermost
        .route("/api/notifications/mattermost", post(notify::post_notification))
        // Misc
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/hello", get(hello))
        // Frontend build
        .fallback_service(static_dir)
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::test_state_with;
    use reqwest::StatusCode;

    async fn serve(name: &str) -> (String, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("taskdesk_static_{name}_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("index.html"), "<h1>taskdesk</h1>").unwrap();

        let static_dir = dir.to_string_lossy().into_owned();
        let (state, path) = test_state_with(name, move |s| {
            s.static_dir = static_dir;
            s.version = "1.2.3".into();
        });
        let app = router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), path)
    }

    #[tokio::test]
    async fn custom_endpoints() {
        let (base, path) = serve("routes_misc").await;
        let http = reqwest::Client::new();

        let health: Value = http.get(format!("{base}/health")).send().await.unwrap().json().await.unwrap();
        assert_eq!(health, json!({ "status": "ok" }));

        let version: Value = http.get(format!("{base}/version")).send().await.unwrap().json().await.unwrap();
        assert_eq!(version["version"], "1.2.3");

        let res = http.get(format!("{base}/hello")).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let index = http.get(format!("{base}/")).send().await.unwrap().text().await.unwrap();
        assert!(index.contains("taskdesk"));
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn login_then_use_the_collection_api() {
        let (base, path) = serve("routes_api").await;
        let http = reqwest::Client::new();

        let auth: Value = http
            .post(format!("{base}/api/collections/users/auth-with-password"))
            .json(&json!({ "identity": "admin", "password": "changeme123" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let token = auth["token"].as_str().unwrap().to_string();

        let hello = http.get(format!("{base}/hello")).bearer_auth(&token).send().await.unwrap();
        assert_eq!(hello.text().await.unwrap(), "Hello world!");

        let created: Value = http
            .post(format!("{base}/api/collections/tasks/records"))
            .bearer_auth(&token)
            .json(&json!({ "title": "Route me", "priority": "high" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = created["id"].as_str().unwrap();

        let list: Value = http
            .get(format!("{base}/api/collections/tasks/records"))
            .query(&[("filter", "priority = 'high'")])
            .bearer_auth(&token)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(list["totalItems"], 1);
        assert_eq!(list["items"][0]["id"], id);

        let res = http
            .patch(format!("{base}/api/collections/tasks/records/{id}"))
            .bearer_auth(&token)
            .json(&json!({ "status": "done" }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = http
            .delete(format!("{base}/api/collections/tasks/records/{id}"))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);

        let missing = http
            .get(format!("{base}/api/collections/tasks/records/{id}"))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        let body: Value = missing.json().await.unwrap();
        assert_eq!(body["status"], 404);
        let _ = std::fs::remove_file(path);
    }
}
