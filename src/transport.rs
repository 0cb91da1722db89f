//! An HTTP client that talks to the Shinara backend.
use async_trait::async_trait;
use reqwest::{header, Url};

use crate::{error::TransportError, Error, Platform, Result};

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Header carrying the platform name.
pub const PLATFORM_HEADER: &str = "X-SDK-Platform";

/// Backend endpoints used by the SDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// `GET /api/key/validate`
    ValidateKey,
    /// `POST /api/code/validate`
    ValidateCode,
    /// `POST /sdknewtrackingsession`
    NewTrackingSession,
    /// `POST /newuser`
    NewUser,
    /// `POST /iappurchase`
    Purchase,
    /// `POST /appopen`
    AppOpen,
}

impl Endpoint {
    /// Path of the endpoint relative to the base URL.
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::ValidateKey => "/api/key/validate",
            Endpoint::ValidateCode => "/api/code/validate",
            Endpoint::NewTrackingSession => "/sdknewtrackingsession",
            Endpoint::NewUser => "/newuser",
            Endpoint::Purchase => "/iappurchase",
            Endpoint::AppOpen => "/appopen",
        }
    }

    /// Only key validation is a `GET`, everything else is a `POST` with a JSON body.
    pub fn method(&self) -> reqwest::Method {
        match self {
            Endpoint::ValidateKey => reqwest::Method::GET,
            _ => reqwest::Method::POST,
        }
    }
}

/// A request to one of the backend [`Endpoint`]s.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Target endpoint.
    pub endpoint: Endpoint,
    /// JSON body. `None` for requests without a body.
    pub body: Option<serde_json::Value>,
}

impl Request {
    pub(crate) fn get(endpoint: Endpoint) -> Request {
        Request {
            endpoint,
            body: None,
        }
    }

    pub(crate) fn post(endpoint: Endpoint, body: &impl serde::Serialize) -> Result<Request> {
        let body = serde_json::to_value(body).map_err(TransportError::from)?;
        Ok(Request {
            endpoint,
            body: Some(body),
        })
    }
}

/// Sends requests to the backend and returns parsed JSON responses.
///
/// [`HttpTransport`] is used by default. Custom implementations can be plugged in with
/// [`ClientConfig::transport`](crate::ClientConfig::transport).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` and return the parsed response body. An empty body is returned as
    /// [`serde_json::Value::Null`].
    async fn send(&self, request: Request) -> std::result::Result<serde_json::Value, TransportError>;
}

/// [`Transport`] over HTTPS using `reqwest`.
pub struct HttpTransport {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
    platform: Platform,
}

impl HttpTransport {
    /// Create a transport sending requests to `base_url`.
    pub fn new(base_url: &str, api_key: impl Into<String>, platform: Platform) -> Result<Self> {
        let base_url = Url::parse(base_url).map_err(Error::InvalidBaseUrl)?;
        Ok(HttpTransport {
            client: reqwest::Client::new(),
            base_url,
            api_key: api_key.into(),
            platform,
        })
    }

    fn url(&self, endpoint: Endpoint) -> Url {
        let mut url = self.base_url.clone();
        let path = format!("{}{}", url.path().trim_end_matches('/'), endpoint.path());
        url.set_path(&path);
        url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: Request) -> std::result::Result<serde_json::Value, TransportError> {
        let url = self.url(request.endpoint);

        log::debug!(target: "shinara", endpoint = request.endpoint.path(); "sending request");
        let mut builder = self
            .client
            .request(request.endpoint.method(), url)
            .header(API_KEY_HEADER, &self.api_key)
            .header(PLATFORM_HEADER, self.platform.as_str())
            .header(header::ACCEPT, "application/json");
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;

        let response = response.error_for_status().map_err(|err| {
            log::warn!(target: "shinara", endpoint = request.endpoint.path(); "received non-2xx response: {:?}", err.status());
            TransportError::from(err)
        })?;

        let bytes = response.bytes().await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(serde_json::Value::Null);
        }

        Ok(serde_json::from_slice(&bytes)?)
    }
}
