//! In-process stand-in for the Apstra API used by the client tests.

use super::ApiSession;
use crate::config::{Config, Credentials};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct MockState {
    pub logins: AtomicUsize,
    generation: AtomicUsize,
    pub reject_all_tokens: AtomicBool,
    pub blueprints: Mutex<Vec<Value>>,
    pub revisions: Mutex<HashMap<String, Value>>,
}

impl MockState {
    /// Invalidate every issued token, as an expired session would.
    pub fn expire_tokens(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn current_token(&self) -> String {
        format!("token-{}", self.generation.load(Ordering::SeqCst))
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        !self.reject_all_tokens.load(Ordering::SeqCst)
            && headers
                .get("AuthToken")
                .and_then(|v| v.to_str().ok())
                .map(|t| t == self.current_token())
                .unwrap_or(false)
    }
}

pub struct MockApstra {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
}

impl MockApstra {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .route("/api/aaa/login", post(login))
            .route("/api/blueprints", get(blueprints))
            .route("/api/blueprints/{id}/revisions", get(revisions))
            .route("/api/broken", get(broken))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn config(&self) -> Config {
        Config::from_toml(&format!(
            "[api]\nserver = \"http://{}\"\nrequest_timeout_seconds = 5\n\n[transfer]\nmethod = \"scp\"\nhost = \"backup.example.net\"\n",
            self.addr
        ))
        .unwrap()
    }

    pub fn session(&self) -> Arc<ApiSession> {
        self.session_with("admin", "admin")
    }

    pub fn session_with(&self, username: &str, password: &str) -> Arc<ApiSession> {
        let credentials = Credentials {
            api_username: username.to_string(),
            api_password: password.to_string(),
            ..Default::default()
        };
        Arc::new(ApiSession::new(&self.config().api, &credentials).unwrap())
    }

    pub fn set_blueprints(&self, items: Value) {
        *self.state.blueprints.lock().unwrap() = items.as_array().cloned().unwrap_or_default();
    }

    pub fn set_revisions(&self, blueprint_id: &str, body: Value) {
        self.state
            .revisions
            .lock()
            .unwrap()
            .insert(blueprint_id.to_string(), body);
    }
}

async fn login(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    state.logins.fetch_add(1, Ordering::SeqCst);
    if body["username"] != "admin" || body["password"] != "admin" {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "errors": "bad credentials" })))
            .into_response();
    }
    Json(json!({ "token": state.current_token(), "id": "user-1" })).into_response()
}

async fn blueprints(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let items = state.blueprints.lock().unwrap().clone();
    Json(json!({ "items": items })).into_response()
}

async fn revisions(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.revisions.lock().unwrap().get(&id) {
        Some(body) => Json(body.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn broken() -> StatusCode {
    StatusCode::INTERNAL_SERVER_ERROR
}
