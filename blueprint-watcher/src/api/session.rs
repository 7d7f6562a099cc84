//! Authenticated HTTP session against the Apstra API.
//!
//! The session logs in lazily, caches the token and reuses it for every
//! request. A 401 on a request triggers exactly one re-login and one retry
//! of that request; a second 401 surfaces as [`ApiError::Auth`].

use crate::config::{ApiConfig, Credentials};
use crate::utils::errors::ApiError;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::RwLock;

const LOGIN_PATH: &str = "/api/aaa/login";
const TOKEN_HEADER: &str = "AuthToken";

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

pub struct ApiSession {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    token: RwLock<Option<String>>,
}

impl ApiSession {
    pub fn new(api: &ApiConfig, credentials: &Credentials) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(api.request_timeout())
            .danger_accept_invalid_certs(api.accept_invalid_certs)
            .build()?;

        Ok(Self {
            client,
            base_url: api.base_url(),
            username: credentials.api_username.clone(),
            password: credentials.api_password.clone(),
            token: RwLock::new(None),
        })
    }

    async fn login(&self) -> Result<String, ApiError> {
        let url = format!("{}{}", self.base_url, LOGIN_PATH);
        let body = serde_json::json!({
            "username": self.username,
            "password": self.password,
        });

        let resp = self.client.post(&url).json(&body).send().await?;
        let status = resp.status();
        if status.is_client_error() {
            return Err(ApiError::Auth(format!("login rejected with status {}", status)));
        }
        if !status.is_success() {
            return Err(ApiError::Transient(format!("login returned status {}", status)));
        }

        let login: LoginResponse = resp
            .json()
            .await
            .map_err(|e| ApiError::Auth(format!("login response without token: {}", e)))?;

        tracing::info!("Authenticated to Apstra API at {}", self.base_url);
        *self.token.write().await = Some(login.token.clone());
        Ok(login.token)
    }

    async fn current_token(&self) -> Result<String, ApiError> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }
        self.login().await
    }

    /// Forget `stale` unless another task already replaced it.
    async fn invalidate(&self, stale: &str) {
        let mut token = self.token.write().await;
        if token.as_deref() == Some(stale) {
            *token = None;
        }
    }

    async fn send_get(&self, path: &str, token: &str) -> Result<reqwest::Response, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        Ok(self
            .client
            .get(&url)
            .header(TOKEN_HEADER, token)
            .send()
            .await?)
    }

    /// GET `path` and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let token = self.current_token().await?;
        let mut resp = self.send_get(path, &token).await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            tracing::info!("Session expired on GET {}, re-authenticating", path);
            self.invalidate(&token).await;
            let fresh = self.current_token().await?;
            resp = self.send_get(path, &fresh).await?;
            if resp.status() == StatusCode::UNAUTHORIZED {
                return Err(ApiError::Auth(format!(
                    "GET {} still unauthorized after re-authentication",
                    path
                )));
            }
        }

        let status = resp.status();
        if !status.is_success() {
            if status == StatusCode::NOT_FOUND {
                tracing::warn!("GET {} not found, check Apstra version compatibility", path);
            }
            return Err(ApiError::Transient(format!("GET {} returned status {}", path, status)));
        }

        resp.json::<T>()
            .await
            .map_err(|e| ApiError::Transient(format!("malformed response from {}: {}", path, e)))
    }
}
