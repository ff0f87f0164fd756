// # Load-Balancing API Client
//
// reqwest-based access to a REST load-balancing API, plugged into the
// convergence core through `ResourceApi` and `CredentialRefresher`.
//
// ## Responsibilities
//
// - One HTTP request per call; every non-2xx response becomes an `ApiError`
//   with the body buffered once
// - Token attachment (`X-Auth-Token`) from a shared `TokenStore`
// - Credential refresh via the identity API (`PasswordAuth`)
//
// ## Not here
//
// - Retry, backoff, polling and locking all belong to `lbaas-core`
// - No background tasks, no caching beyond the current token
//
// ## Security Requirements
//
// - Tokens and passwords NEVER appear in logs or Debug output
//
// ## API Reference
//
// - Fetch:  GET    `/v2/lbaas/{kind}/{id}`  -> `{"<envelope>": {...}}`
// - Create: POST   `/v2/lbaas/{kind}`       <- `{"<envelope>": {...}}`
// - Update: PUT    `/v2/lbaas/{kind}/{id}`  <- `{"<envelope>": {...}}`
// - Delete: DELETE `/v2/lbaas/{kind}/{id}`
// - Token:  POST   `/v3/auth/tokens`        -> `X-Subject-Token` header

use async_trait::async_trait;
use lbaas_core::error::{ApiError, Error, Result};
use lbaas_core::status::ResourceId;
use lbaas_core::traits::{CredentialRefresher, ResourceApi};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Default HTTP timeout for API requests (30 seconds)
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Header carrying the token on API requests
const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";

/// Header carrying the issued token on identity responses
const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";

fn build_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(DEFAULT_HTTP_TIMEOUT)
        .build()
        .map_err(|e| Error::http(format!("Failed to build HTTP client: {e}")))
}

/// Load-balancing resource kinds addressable through the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Load balancer
    LoadBalancer,
    /// Listener on a load balancer
    Listener,
    /// Target group (pool of members)
    Pool,
    /// Listener routing policy
    L7Policy,
}

impl ResourceKind {
    /// Collection path segment under `/v2/lbaas`
    pub fn path(&self) -> &'static str {
        match self {
            ResourceKind::LoadBalancer => "loadbalancers",
            ResourceKind::Listener => "listeners",
            ResourceKind::Pool => "pools",
            ResourceKind::L7Policy => "l7policies",
        }
    }

    /// JSON key wrapping the resource in request and response bodies
    pub fn envelope(&self) -> &'static str {
        match self {
            ResourceKind::LoadBalancer => "loadbalancer",
            ResourceKind::Listener => "listener",
            ResourceKind::Pool => "pool",
            ResourceKind::L7Policy => "l7policy",
        }
    }

    /// Human-readable name used in diagnostics
    pub fn display_name(&self) -> &'static str {
        match self {
            ResourceKind::LoadBalancer => "load balancer",
            ResourceKind::Listener => "listener",
            ResourceKind::Pool => "target group",
            ResourceKind::L7Policy => "policy",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "loadbalancer" | "load-balancer" | "lb" => Ok(ResourceKind::LoadBalancer),
            "listener" => Ok(ResourceKind::Listener),
            "pool" | "target-group" => Ok(ResourceKind::Pool),
            "l7policy" | "policy" => Ok(ResourceKind::L7Policy),
            other => Err(Error::config(format!("Unknown resource kind: {other}"))),
        }
    }
}

/// A fetched resource
///
/// Only the fields the convergence core needs are typed; the rest of the
/// representation is kept in `attributes`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LbaasResource {
    /// Resource identifier
    pub id: ResourceId,

    /// Lifecycle status (e.g., `ACTIVE`, `PENDING_UPDATE`)
    pub provisioning_status: String,

    /// Traffic status, when the resource kind reports one
    #[serde(default)]
    pub operating_status: Option<String>,

    /// Remaining fields, untouched
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// Token shared between the API client and its refresher
///
/// Cloning shares the underlying slot.
#[derive(Clone, Default)]
pub struct TokenStore {
    token: Arc<RwLock<Option<String>>>,
}

impl TokenStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `token`
    pub fn with_token(token: impl Into<String>) -> Self {
        let store = Self::new();
        store.set(token);
        store
    }

    /// Current token, if one has been issued
    pub fn get(&self) -> Option<String> {
        self.token.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the current token
    pub fn set(&self, token: impl Into<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token.into());
    }
}

// Never expose the token itself
impl fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.get().is_some() { "<REDACTED>" } else { "<none>" };
        f.debug_struct("TokenStore").field("token", &state).finish()
    }
}

/// A pre-issued token that cannot be renewed
///
/// A 401 with this refresher is final: `refresh` always fails, and the
/// executor surfaces an authentication error.
#[derive(Debug, Clone, Default)]
pub struct StaticToken;

#[async_trait]
impl CredentialRefresher for StaticToken {
    async fn refresh(&self) -> Result<()> {
        Err(Error::auth("static token was rejected and cannot be refreshed"))
    }
}

/// Password credentials for the identity API
///
/// # Security
///
/// The Debug implementation does NOT expose the password.
#[derive(Clone)]
pub struct PasswordAuth {
    client: reqwest::Client,
    auth_url: String,
    username: String,
    password: String,
    project: String,
    domain: String,
    tokens: TokenStore,
}

impl fmt::Debug for PasswordAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordAuth")
            .field("auth_url", &self.auth_url)
            .field("username", &self.username)
            .field("password", &"<REDACTED>")
            .field("project", &self.project)
            .field("domain", &self.domain)
            .finish()
    }
}

impl PasswordAuth {
    /// Create password credentials that write issued tokens into `tokens`
    ///
    /// # Parameters
    ///
    /// - `auth_url`: Identity API base URL (without `/v3`)
    /// - `username` / `password`: User credentials
    /// - `project`: Project name the token is scoped to
    /// - `domain`: Domain of both the user and the project
    pub fn new(
        auth_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        project: impl Into<String>,
        domain: impl Into<String>,
        tokens: TokenStore,
    ) -> Result<Self> {
        let username = username.into();
        let password = password.into();

        if username.is_empty() || password.is_empty() {
            return Err(Error::config("Username and password are required"));
        }

        Ok(Self {
            client: build_http_client()?,
            auth_url: auth_url.into().trim_end_matches('/').to_string(),
            username,
            password,
            project: project.into(),
            domain: domain.into(),
            tokens,
        })
    }

    /// Request a new token and store it
    ///
    /// # API Call
    ///
    /// ```http
    /// POST /v3/auth/tokens
    /// {"auth": {"identity": {"methods": ["password"], ...}, "scope": {...}}}
    /// ```
    pub async fn authenticate(&self) -> Result<()> {
        let url = format!("{}/v3/auth/tokens", self.auth_url);
        tracing::debug!(url = %url, username = %self.username, "Requesting token");

        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": self.username,
                            "domain": { "name": self.domain },
                            "password": self.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": self.project,
                        "domain": { "name": self.domain },
                    }
                }
            }
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::http(format!("Token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::auth(format!(
                "identity service rejected credentials: {} - {}",
                status.as_u16(),
                text
            )));
        }

        let token = response
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::auth(format!("identity response has no {SUBJECT_TOKEN_HEADER} header")))?;

        self.tokens.set(token);
        tracing::info!(username = %self.username, "Obtained new token");
        Ok(())
    }
}

#[async_trait]
impl CredentialRefresher for PasswordAuth {
    async fn refresh(&self) -> Result<()> {
        self.authenticate().await
    }
}

/// Client for the load-balancing API
///
/// Cheap to clone; clones share the connection pool and token store.
#[derive(Clone)]
pub struct LbaasClient {
    client: reqwest::Client,
    endpoint: String,
    tokens: TokenStore,
}

impl fmt::Debug for LbaasClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LbaasClient")
            .field("endpoint", &self.endpoint)
            .field("tokens", &self.tokens)
            .finish()
    }
}

impl LbaasClient {
    /// Create a client for the API at `endpoint`
    ///
    /// # Returns
    ///
    /// - `Ok(LbaasClient)`: Client ready for use
    /// - `Err(Error::Config)`: The endpoint is empty
    /// - `Err(Error::Http)`: The HTTP client could not be built
    pub fn new(endpoint: impl Into<String>, tokens: TokenStore) -> Result<Self> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        if endpoint.is_empty() {
            return Err(Error::config("Load-balancing API endpoint is required"));
        }

        Ok(Self {
            client: build_http_client()?,
            endpoint,
            tokens,
        })
    }

    /// Token store used to authenticate requests
    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    /// `ResourceApi` view of one resource kind
    pub fn resource(&self, kind: ResourceKind) -> ResourceEndpoint {
        ResourceEndpoint {
            client: self.clone(),
            kind,
        }
    }

    fn collection_url(&self, kind: ResourceKind) -> String {
        format!("{}/v2/lbaas/{}", self.endpoint, kind.path())
    }

    fn item_url(&self, kind: ResourceKind, id: &ResourceId) -> String {
        format!("{}/{}", self.collection_url(kind), id)
    }

    /// Fetch a resource
    ///
    /// ```http
    /// GET /v2/lbaas/{kind}/{id}
    /// ```
    pub async fn get(&self, kind: ResourceKind, id: &ResourceId) -> std::result::Result<LbaasResource, ApiError> {
        let url = self.item_url(kind, id);
        let value = self.send(Method::GET, &url, None).await?;
        unwrap_envelope(kind, &Method::GET, &url, value)
    }

    /// Create a resource from its attributes
    ///
    /// ```http
    /// POST /v2/lbaas/{kind}
    /// {"<envelope>": attributes}
    /// ```
    pub async fn create(
        &self,
        kind: ResourceKind,
        attributes: Value,
    ) -> std::result::Result<LbaasResource, ApiError> {
        let url = self.collection_url(kind);
        let body = envelope_body(kind, attributes);
        let value = self.send(Method::POST, &url, Some(&body)).await?;
        unwrap_envelope(kind, &Method::POST, &url, value)
    }

    /// Update a resource's attributes
    ///
    /// ```http
    /// PUT /v2/lbaas/{kind}/{id}
    /// {"<envelope>": attributes}
    /// ```
    pub async fn update(
        &self,
        kind: ResourceKind,
        id: &ResourceId,
        attributes: Value,
    ) -> std::result::Result<LbaasResource, ApiError> {
        let url = self.item_url(kind, id);
        let body = envelope_body(kind, attributes);
        let value = self.send(Method::PUT, &url, Some(&body)).await?;
        unwrap_envelope(kind, &Method::PUT, &url, value)
    }

    /// Request deletion of a resource
    ///
    /// ```http
    /// DELETE /v2/lbaas/{kind}/{id}
    /// ```
    pub async fn delete(&self, kind: ResourceKind, id: &ResourceId) -> std::result::Result<(), ApiError> {
        let url = self.item_url(kind, id);
        self.send(Method::DELETE, &url, None).await?;
        Ok(())
    }

    /// Issue one request and return its JSON body, if any
    ///
    /// The body of a failed response is read exactly once into the
    /// returned `ApiError`.
    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> std::result::Result<Option<Value>, ApiError> {
        tracing::debug!(method = %method, url = %url, "Sending request");

        let mut request = self
            .client
            .request(method.clone(), url)
            .header("Accept", "application/json");
        if let Some(token) = self.tokens.get() {
            request = request.header(AUTH_TOKEN_HEADER, token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::transport(method.as_str(), url, format!("HTTP request failed: {e}")))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ApiError::transport(method.as_str(), url, format!("Failed to read response: {e}")))?;

        if !status.is_success() {
            tracing::debug!(method = %method, url = %url, status = status.as_u16(), "Request failed");
            return Err(ApiError::new(method.as_str(), url, status.as_u16(), bytes.to_vec()));
        }

        if bytes.is_empty() {
            return Ok(None);
        }

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| ApiError::transport(method.as_str(), url, format!("Failed to parse response: {e}")))
    }
}

fn envelope_body(kind: ResourceKind, attributes: Value) -> Value {
    let mut body = Map::new();
    body.insert(kind.envelope().to_string(), attributes);
    Value::Object(body)
}

fn unwrap_envelope(
    kind: ResourceKind,
    method: &Method,
    url: &str,
    value: Option<Value>,
) -> std::result::Result<LbaasResource, ApiError> {
    let inner = value
        .and_then(|mut v| v.get_mut(kind.envelope()).map(Value::take))
        .ok_or_else(|| {
            ApiError::transport(
                method.as_str(),
                url,
                format!("Invalid response format: missing '{}' object", kind.envelope()),
            )
        })?;

    serde_json::from_value(inner).map_err(|e| {
        ApiError::transport(method.as_str(), url, format!("Invalid response format: {e}"))
    })
}

/// One resource kind of an [`LbaasClient`], as a [`ResourceApi`]
#[derive(Debug, Clone)]
pub struct ResourceEndpoint {
    client: LbaasClient,
    kind: ResourceKind,
}

impl ResourceEndpoint {
    /// Resource kind this endpoint serves
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }
}

#[async_trait]
impl ResourceApi for ResourceEndpoint {
    type Resource = LbaasResource;

    fn resource_type(&self) -> &str {
        self.kind.display_name()
    }

    async fn fetch(&self, id: &ResourceId) -> std::result::Result<LbaasResource, ApiError> {
        self.client.get(self.kind, id).await
    }

    async fn delete(&self, id: &ResourceId) -> std::result::Result<(), ApiError> {
        self.client.delete(self.kind, id).await
    }

    fn status_of(&self, resource: &LbaasResource) -> String {
        resource.provisioning_status.clone()
    }
}
