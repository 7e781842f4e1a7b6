//! Typed Rust client for the DigitalOcean v2 API.
//!
//! Covers the subset needed for managing machine droplets:
//! droplets (list by tag, get, create, delete), regions, sizes and
//! account SSH keys (get by fingerprint, create).

mod types;

pub use types::*;

use reqwest::StatusCode;

const BASE_URL: &str = "https://api.digitalocean.com/v2";

/// Maximum page size the droplet listing endpoint accepts.
const PER_PAGE: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("digitalocean api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("digitalocean api {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: StatusCode,
        body: String,
    },
}

impl Error {
    /// HTTP status of the failed call, if the server answered at all.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Request(e) => e.status(),
            Self::Api { status, .. } => Some(*status),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }

    /// 422 Unprocessable Entity; the key registry answers this for
    /// duplicate public keys.
    pub fn is_unprocessable(&self) -> bool {
        self.status() == Some(StatusCode::UNPROCESSABLE_ENTITY)
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

    /// Human readable message from the API error body, falling back to
    /// the raw body or the transport error.
    pub fn message(&self) -> String {
        match self {
            Self::Request(e) => e.to_string(),
            Self::Api { body, .. } => serde_json::from_str::<ApiErrorBody>(body)
                .map(|b| b.message)
                .unwrap_or_else(|_| body.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Client for the DigitalOcean REST API.
#[derive(Clone)]
pub struct DoClient {
    token: String,
    base_url: String,
    http: reqwest::Client,
}

impl DoClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            base_url: BASE_URL.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Point the client at a different API root (used by tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn check(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api {
                endpoint,
                status,
                body,
            });
        }
        Ok(resp)
    }

    /// Like `check` but also treats 404 as success (for delete idempotency).
    async fn check_allow_404(
        resp: reqwest::Response,
        endpoint: &'static str,
    ) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api {
                endpoint,
                status,
                body,
            });
        }
        Ok(resp)
    }

    // ── Droplets ────────────────────────────────────────────────────

    /// List every droplet carrying `tag`, following pagination.
    pub async fn list_droplets_by_tag(&self, tag: &str) -> Result<Vec<Droplet>> {
        let mut droplets = Vec::new();
        let mut page = 1usize;

        loop {
            let resp = self
                .http
                .get(self.url("/droplets"))
                .header("Authorization", self.auth())
                .query(&[
                    ("tag_name", tag.to_string()),
                    ("page", page.to_string()),
                    ("per_page", PER_PAGE.to_string()),
                ])
                .send()
                .await?;

            let body: DropletPage = Self::check(resp, "list droplets").await?.json().await?;
            let fetched = body.droplets.len();
            let total = body.meta.map(|m| m.total);
            droplets.extend(body.droplets);

            // Without `meta`, only a short page proves there is nothing left.
            if fetched < PER_PAGE || total.is_some_and(|t| droplets.len() >= t) {
                break;
            }
            page += 1;
        }

        Ok(droplets)
    }

    pub async fn get_droplet(&self, droplet_id: i64) -> Result<Droplet> {
        let resp = self
            .http
            .get(self.url(&format!("/droplets/{droplet_id}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        let envelope: DropletEnvelope = Self::check(resp, "get droplet").await?.json().await?;
        Ok(envelope.droplet)
    }

    pub async fn create_droplet(&self, req: &CreateDropletRequest) -> Result<Droplet> {
        let resp = self
            .http
            .post(self.url("/droplets"))
            .header("Authorization", self.auth())
            .json(req)
            .send()
            .await?;

        let envelope: DropletEnvelope = Self::check(resp, "create droplet").await?.json().await?;
        Ok(envelope.droplet)
    }

    pub async fn delete_droplet(&self, droplet_id: i64) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/droplets/{droplet_id}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check_allow_404(resp, "delete droplet").await?;
        Ok(())
    }

    // ── Regions & sizes ─────────────────────────────────────────────

    pub async fn list_regions(&self) -> Result<Vec<Region>> {
        let resp = self
            .http
            .get(self.url("/regions"))
            .header("Authorization", self.auth())
            .query(&[("per_page", PER_PAGE)])
            .send()
            .await?;

        let page: RegionPage = Self::check(resp, "list regions").await?.json().await?;
        Ok(page.regions)
    }

    pub async fn list_sizes(&self) -> Result<Vec<Size>> {
        let resp = self
            .http
            .get(self.url("/sizes"))
            .header("Authorization", self.auth())
            .query(&[("per_page", PER_PAGE)])
            .send()
            .await?;

        let page: SizePage = Self::check(resp, "list sizes").await?.json().await?;
        Ok(page.sizes)
    }

    // ── SSH keys ────────────────────────────────────────────────────

    /// Look up an account key by fingerprint. A 404 yields `None`.
    pub async fn get_key_by_fingerprint(&self, fingerprint: &str) -> Result<Option<SshKey>> {
        let resp = self
            .http
            .get(self.url(&format!("/account/keys/{fingerprint}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let envelope: KeyEnvelope = Self::check(resp, "get ssh key").await?.json().await?;
        Ok(Some(envelope.ssh_key))
    }

    pub async fn create_key(&self, req: &CreateKeyRequest) -> Result<SshKey> {
        let resp = self
            .http
            .post(self.url("/account/keys"))
            .header("Authorization", self.auth())
            .json(req)
            .send()
            .await?;

        let envelope: KeyEnvelope = Self::check(resp, "create ssh key").await?.json().await?;
        Ok(envelope.ssh_key)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn droplet(id: i64) -> serde_json::Value {
        json!({ "id": id, "name": format!("node-{id}"), "status": "active", "tags": ["uid-1"] })
    }

    #[tokio::test]
    async fn list_droplets_follows_pages() {
        let server = MockServer::start().await;
        let first: Vec<_> = (0..PER_PAGE as i64).map(droplet).collect();

        Mock::given(method("GET"))
            .and(path("/droplets"))
            .and(query_param("tag_name", "uid-1"))
            .and(query_param("page", "1"))
            .and(header("Authorization", "Bearer t0k3n"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "droplets": first, "meta": { "total": PER_PAGE + 1 } })),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/droplets"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({ "droplets": [droplet(9999)], "meta": { "total": PER_PAGE + 1 } }),
            ))
            .expect(1)
            .mount(&server)
            .await;

        let client = DoClient::new("t0k3n").with_base_url(server.uri());
        let droplets = client.list_droplets_by_tag("uid-1").await.unwrap();

        assert_eq!(droplets.len(), PER_PAGE + 1);
        assert_eq!(droplets.last().unwrap().id, 9999);
    }

    #[tokio::test]
    async fn list_droplets_without_meta_reads_until_short_page() {
        let server = MockServer::start().await;
        let full: Vec<_> = (0..PER_PAGE as i64).map(droplet).collect();

        Mock::given(method("GET"))
            .and(path("/droplets"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "droplets": full })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/droplets"))
            .and(query_param("page", "2"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "droplets": [droplet(9999)] })),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/droplets"))
            .and(query_param("page", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "droplets": [] })))
            .expect(0)
            .mount(&server)
            .await;

        let client = DoClient::new("t0k3n").with_base_url(server.uri());
        let droplets = client.list_droplets_by_tag("uid-1").await.unwrap();

        assert_eq!(droplets.len(), PER_PAGE + 1);
    }

    #[tokio::test]
    async fn missing_key_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/account/keys/aa:bb"))
            .respond_with(ResponseTemplate::new(404).set_body_json(
                json!({ "id": "not_found", "message": "The resource you were accessing could not be found." }),
            ))
            .mount(&server)
            .await;

        let client = DoClient::new("t").with_base_url(server.uri());
        assert!(client.get_key_by_fingerprint("aa:bb").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn api_errors_expose_status_and_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/droplets"))
            .respond_with(ResponseTemplate::new(422).set_body_json(
                json!({ "id": "unprocessable_entity", "message": "You specified an invalid size." }),
            ))
            .mount(&server)
            .await;

        let client = DoClient::new("t").with_base_url(server.uri());
        let err = client
            .create_droplet(&CreateDropletRequest {
                name: "n".into(),
                region: "fra1".into(),
                size: "huge".into(),
                image: "ubuntu-16-04-x64".into(),
                ssh_keys: vec![],
                backups: false,
                ipv6: false,
                private_networking: false,
                user_data: None,
                tags: vec![],
            })
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(StatusCode::UNPROCESSABLE_ENTITY));
        assert_eq!(err.message(), "You specified an invalid size.");
    }

    #[tokio::test]
    async fn delete_tolerates_missing_droplet() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/droplets/42"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = DoClient::new("t").with_base_url(server.uri());
        client.delete_droplet(42).await.unwrap();
    }
}
