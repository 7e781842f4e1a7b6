//! Typed Rust client for the Fly.io Machines API.
//!
//! Covers the subset needed for managing machines on behalf of the
//! controller: list, get, create and delete, including metadata and
//! file injection.

mod types;

pub use types::*;

use reqwest::StatusCode;

const BASE_URL: &str = "https://api.machines.dev/v1";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("fly api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("fly api {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: StatusCode,
        body: String,
    },
}

impl Error {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Request(e) => e.status(),
            Self::Api { status, .. } => Some(*status),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }

    /// The server refused the request itself (bad parameters, quota),
    /// as opposed to a timeout or rate limit.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self.status(),
            Some(s) if s.is_client_error()
                && s != StatusCode::REQUEST_TIMEOUT
                && s != StatusCode::TOO_MANY_REQUESTS
        )
    }

    pub fn message(&self) -> String {
        match self {
            Self::Request(e) => e.to_string(),
            Self::Api { body, .. } => serde_json::from_str::<ApiErrorBody>(body)
                .map(|b| b.error)
                .unwrap_or_else(|_| body.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Client for the Fly.io Machines REST API, scoped to one app.
#[derive(Clone)]
pub struct FlyClient {
    token: String,
    app: String,
    base_url: String,
    http: reqwest::Client,
}

impl FlyClient {
    pub fn new(token: impl Into<String>, app: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            app: app.into(),
            base_url: BASE_URL.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    fn url(&self, path: &str) -> String {
        format!("{}/apps/{}{path}", self.base_url, self.app)
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn check(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api { endpoint, status, body });
        }
        Ok(resp)
    }

    /// Like `check` but also treats 404 as success (for delete idempotency).
    async fn check_allow_404(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api { endpoint, status, body });
        }
        Ok(resp)
    }

    // ── Machines ─────────────────────────────────────────────────────

    pub async fn list_machines(&self) -> Result<Vec<Machine>> {
        let resp = self
            .http
            .get(self.url("/machines"))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, "list machines")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    pub async fn create_machine(&self, req: &CreateMachineRequest) -> Result<Machine> {
        let resp = self
            .http
            .post(self.url("/machines"))
            .header("Authorization", self.auth())
            .json(req)
            .send()
            .await?;

        Self::check(resp, "create machine")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    pub async fn get_machine(&self, machine_id: &str) -> Result<Machine> {
        let resp = self
            .http
            .get(self.url(&format!("/machines/{machine_id}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, "get machine")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    /// Force-delete a machine regardless of its state.
    pub async fn delete_machine(&self, machine_id: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/machines/{machine_id}")))
            .header("Authorization", self.auth())
            .query(&[("force", "true")])
            .send()
            .await?;

        Self::check_allow_404(resp, "delete machine").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn machines_expose_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apps/workers/machines"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "id": "148ed193b95789",
                "name": "worker-0",
                "state": "started",
                "region": "ams",
                "private_ip": "fdaa:0:1::3",
                "config": { "image": "ubuntu:22.04", "metadata": { "machine-uid": "abc" } }
            }])))
            .mount(&server)
            .await;

        let client = FlyClient::new("t", "workers").with_base_url(server.uri());
        let machines = client.list_machines().await.unwrap();

        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].metadata("machine-uid"), Some("abc"));
        assert_eq!(machines[0].metadata("other"), None);
    }

    #[tokio::test]
    async fn delete_forces_and_tolerates_404() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/apps/workers/machines/gone"))
            .and(query_param("force", "true"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = FlyClient::new("t", "workers").with_base_url(server.uri());
        client.delete_machine("gone").await.unwrap();
    }

    #[tokio::test]
    async fn error_message_prefers_api_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apps/workers/machines/nope"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(json!({ "error": "machine not found" })),
            )
            .mount(&server)
            .await;

        let client = FlyClient::new("t", "workers").with_base_url(server.uri());
        let err = client.get_machine("nope").await.unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(err.message(), "machine not found");
    }
}
