//! HTTP implementations of [`ControlPlane`] and [`ServerProbe`].

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use tether_core::config::TlsSettings;
use tether_core::{CatalogEntry, Credential, CredentialRequest};

use crate::discovery::{LoginParams, ServerProbe};
use crate::{ControlPlane, ControlPlaneError};

const TOKEN_HEADER: &str = "X-Consul-Token";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings for one control-plane server.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// `http(s)://host:port`, no trailing slash.
    pub base_url: String,
    pub token: Option<String>,
    pub ca_cert_file: Option<String>,
    pub timeout: Duration,
}

impl ClientSettings {
    pub fn for_address(addr: SocketAddr, tls: &TlsSettings, token: Option<String>) -> Self {
        let scheme = if tls.enabled { "https" } else { "http" };
        Self {
            base_url: format!("{}://{}", scheme, addr),
            token,
            ca_cert_file: if tls.enabled { tls.ca_cert_file.clone() } else { None },
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

fn build_http_client(ca_cert_file: Option<&str>, timeout: Duration) -> Result<reqwest::Client, ControlPlaneError> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(path) = ca_cert_file {
        let pem = std::fs::read(path)
            .map_err(|e| ControlPlaneError::Setup(format!("reading CA file {}: {}", path, e)))?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .map_err(|e| ControlPlaneError::Setup(format!("parsing CA file {}: {}", path, e)))?;
        builder = builder.add_root_certificate(cert);
    }
    builder.build().map_err(|e| ControlPlaneError::Setup(e.to_string()))
}

/// Shared request plumbing: token header, timing, status translation.
#[derive(Clone)]
struct Transport {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl Transport {
    fn request(&self, method: Method, path: &str) -> (String, RequestBuilder) {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.request(method, &url);
        if let Some(token) = self.token.as_deref().filter(|t| !t.is_empty()) {
            req = req.header(TOKEN_HEADER, token);
        }
        (url, req)
    }

    async fn send(&self, op: &'static str, url: &str, req: RequestBuilder, what: &str) -> Result<reqwest::Response, ControlPlaneError> {
        let started = Instant::now();
        let res = req.send().await;
        histogram!("consul_request_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op);
        let resp = res.map_err(|source| {
            counter!("consul_request_errors_total", 1u64, "op" => op);
            ControlPlaneError::Transport { url: url.to_string(), source }
        })?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.map_err(|source| {
            counter!("consul_request_errors_total", 1u64, "op" => op);
            warn!(op, %url, status = status.as_u16(), error = %source, "reading error response failed");
            ControlPlaneError::Transport { url: url.to_string(), source }
        })?;
        let err = ControlPlaneError::from_response(status.as_u16(), &body, what);
        if !err.is_not_found() {
            counter!("consul_request_errors_total", 1u64, "op" => op);
            debug!(op, %url, status = status.as_u16(), "control plane rejected request");
        }
        Err(err)
    }

    async fn json<T: DeserializeOwned>(&self, op: &'static str, method: Method, path: &str, body: Option<&impl Serialize>, what: &str) -> Result<T, ControlPlaneError> {
        let (url, mut req) = self.request(method, path);
        if let Some(b) = body {
            req = req.json(b);
        }
        self.decode(op, url, req, what).await
    }

    async fn decode<T: DeserializeOwned>(&self, op: &'static str, url: String, req: RequestBuilder, what: &str) -> Result<T, ControlPlaneError> {
        let resp = self.send(op, &url, req, what).await?;
        resp.json::<T>().await.map_err(|source| ControlPlaneError::Decode { url, source })
    }

    async fn unit(&self, op: &'static str, method: Method, path: &str, body: Option<&impl Serialize>, what: &str) -> Result<(), ControlPlaneError> {
        let (url, mut req) = self.request(method, path);
        if let Some(b) = body {
            req = req.json(b);
        }
        self.send(op, &url, req, what).await.map(|_| ())
    }
}

/// [`ControlPlane`] over the Consul-compatible HTTP API.
#[derive(Clone)]
pub struct HttpControlPlane {
    transport: Transport,
}

impl HttpControlPlane {
    pub fn new(settings: ClientSettings) -> Result<Self, ControlPlaneError> {
        let http = build_http_client(settings.ca_cert_file.as_deref(), settings.timeout)?;
        Ok(Self { transport: Transport { http, base_url: settings.base_url, token: settings.token } })
    }

    pub fn base_url(&self) -> &str { &self.transport.base_url }
}

#[async_trait::async_trait]
impl ControlPlane for HttpControlPlane {
    async fn register(&self, entry: &CatalogEntry) -> Result<(), ControlPlaneError> {
        let what = format!("service {}", entry.service.id);
        self.transport.unit("register", Method::PUT, "/v1/catalog/register", Some(entry), &what).await
    }

    async fn list_credentials(&self) -> Result<Vec<Credential>, ControlPlaneError> {
        self.transport.json("list_tokens", Method::GET, "/v1/acl/tokens", None::<&()>, "token list").await
    }

    async fn create_credential(&self, req: &CredentialRequest) -> Result<Credential, ControlPlaneError> {
        self.transport.json("create_token", Method::PUT, "/v1/acl/token", Some(req), "token").await
    }

    async fn read_credential(&self, accessor_id: &str) -> Result<Credential, ControlPlaneError> {
        let path = format!("/v1/acl/token/{}", accessor_id);
        let what = format!("token {}", accessor_id);
        self.transport.json("read_token", Method::GET, &path, None::<&()>, &what).await
    }

    async fn delete_credential(&self, accessor_id: &str) -> Result<(), ControlPlaneError> {
        let path = format!("/v1/acl/token/{}", accessor_id);
        let what = format!("token {}", accessor_id);
        self.transport.unit("delete_token", Method::DELETE, &path, None::<&()>, &what).await
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct LoginBody<'a> {
    auth_method: &'a str,
    bearer_token: &'a str,
    #[serde(skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    meta: &'a std::collections::BTreeMap<String, String>,
}

/// Health check and login against one server over HTTP.
#[derive(Clone)]
pub struct HttpServerProbe {
    http: reqwest::Client,
    tls: bool,
}

impl HttpServerProbe {
    pub fn new(tls: &TlsSettings) -> Result<Self, ControlPlaneError> {
        let ca = if tls.enabled { tls.ca_cert_file.as_deref() } else { None };
        Ok(Self { http: build_http_client(ca, DEFAULT_TIMEOUT)?, tls: tls.enabled })
    }

    fn transport(&self, addr: SocketAddr) -> Transport {
        let scheme = if self.tls { "https" } else { "http" };
        Transport { http: self.http.clone(), base_url: format!("{}://{}", scheme, addr), token: None }
    }
}

fn login_request(transport: &Transport, params: &LoginParams) -> (String, RequestBuilder) {
    let (url, mut req) = transport.request(Method::POST, "/v1/acl/login");
    if let Some(dc) = params.datacenter.as_deref().filter(|d| !d.is_empty()) {
        req = req.query(&[("dc", dc)]);
    }
    let body = LoginBody { auth_method: &params.method, bearer_token: &params.bearer_token, meta: &params.meta };
    (url, req.json(&body))
}

#[async_trait::async_trait]
impl ServerProbe for HttpServerProbe {
    async fn check(&self, addr: SocketAddr) -> Result<(), ControlPlaneError> {
        let leader: String = self
            .transport(addr)
            .json("status_leader", Method::GET, "/v1/status/leader", None::<&()>, "leader")
            .await?;
        if leader.is_empty() {
            warn!(%addr, "server reports no leader");
            return Err(ControlPlaneError::Status { status: 200, body: "no cluster leader".into() });
        }
        Ok(())
    }

    async fn login(&self, addr: SocketAddr, params: &LoginParams) -> Result<String, ControlPlaneError> {
        let transport = self.transport(addr);
        let (url, req) = login_request(&transport, params);
        let cred: Credential = transport.decode("login", url, req, "login").await?;
        Ok(cred.secret_id)
    }
}
