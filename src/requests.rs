// src/requests.rs

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Url};
use serde_json::Value;

use crate::error::ParseError;

pub use reqwest::Method;

/// Credentials attached to a single request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestAuth {
    pub session_token: Option<String>,
    pub use_master_key: bool,
}

/// A transport-neutral REST request. `path` is relative to the `/parse/` mount point.
#[derive(Debug, Clone)]
pub struct RestRequest {
    pub method: Method,
    pub path: String,
    pub params: Vec<(String, String)>,
    pub body: Option<Value>,
    pub auth: RequestAuth,
}

impl RestRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        RestRequest {
            method,
            path: path.into(),
            params: Vec::new(),
            body: None,
            auth: RequestAuth::default(),
        }
    }

    pub fn with_params(mut self, params: Vec<(String, String)>) -> Self {
        self.params = params;
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_master_key(mut self, use_master_key: bool) -> Self {
        self.auth.use_master_key = use_master_key;
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Sends REST requests and returns the decoded JSON body.
///
/// Implementations map non-success responses to [`ParseError`] themselves.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: RestRequest) -> Result<Value, ParseError>;
}

/// `reqwest`-backed transport talking to a Parse Server over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    server_url: String,
    master_key: Option<String>,
    http_client: Client,
}

impl HttpTransport {
    /// Builds the HTTP client with the application id and the highest-precedence
    /// key (master, then JavaScript, then REST) as default headers.
    pub fn new(
        server_url: &str,
        app_id: &str,
        javascript_key: Option<&str>,
        rest_api_key: Option<&str>,
        master_key: Option<&str>,
    ) -> Result<Self, ParseError> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            "X-Parse-Application-Id",
            HeaderValue::from_str(app_id).map_err(ParseError::InvalidHeaderValue)?,
        );

        if let Some(mk_str) = master_key {
            default_headers.insert(
                "X-Parse-Master-Key",
                HeaderValue::from_str(mk_str).map_err(ParseError::InvalidHeaderValue)?,
            );
        } else if let Some(js_key_str) = javascript_key {
            default_headers.insert(
                "X-Parse-Javascript-Key",
                HeaderValue::from_str(js_key_str).map_err(ParseError::InvalidHeaderValue)?,
            );
        } else if let Some(rk_str) = rest_api_key {
            default_headers.insert(
                "X-Parse-REST-API-Key",
                HeaderValue::from_str(rk_str).map_err(ParseError::InvalidHeaderValue)?,
            );
        }

        let http_client = Client::builder()
            .default_headers(default_headers)
            .build()
            .map_err(ParseError::ReqwestError)?;

        Ok(Self {
            server_url: normalize_server_url(server_url)?,
            master_key: master_key.map(|s| s.to_string()),
            http_client,
        })
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn endpoint_url(&self, path: &str, params: &[(String, String)]) -> Result<Url, ParseError> {
        let base_url = Url::parse(&self.server_url).map_err(|e| {
            ParseError::InvalidUrl(format!(
                "Base server URL '{}' is invalid: {}",
                self.server_url, e
            ))
        })?;

        let api_path = format!("/parse/{}", path.trim_start_matches('/'));
        let mut full_url = base_url.join(&api_path).map_err(|e| {
            ParseError::InvalidUrl(format!(
                "Failed to join base URL '{}' with API path '{}': {}",
                base_url, api_path, e
            ))
        })?;

        if !params.is_empty() {
            let mut pairs = full_url.query_pairs_mut();
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
        }
        Ok(full_url)
    }
}

/// Ensures a scheme, drops a trailing `/parse` mount and any trailing slash.
pub(crate) fn normalize_server_url(server_url: &str) -> Result<String, ParseError> {
    let mut candidate = server_url.trim().to_string();
    if !candidate.starts_with("http://") && !candidate.starts_with("https://") {
        candidate = format!("http://{}", candidate);
    }

    let parsed = Url::parse(&candidate)?;
    if parsed.cannot_be_a_base() {
        return Err(ParseError::InvalidUrl(format!(
            "'{}' cannot be used as a base URL",
            server_url
        )));
    }

    let mut normalized = parsed.as_str().trim_end_matches('/').to_string();
    if normalized.ends_with("/parse") {
        normalized.truncate(normalized.len() - "/parse".len());
    }
    if normalized.is_empty() {
        return Err(ParseError::InvalidUrl(format!(
            "'{}' has no host after normalization",
            server_url
        )));
    }
    Ok(normalized)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: RestRequest) -> Result<Value, ParseError> {
        let full_url = self.endpoint_url(&request.path, &request.params)?;

        log::debug!(
            "Preparing request: Method={}, URL={}, UseMasterKey={}, SessionToken={}",
            request.method,
            full_url,
            request.auth.use_master_key,
            request.auth.session_token.is_some()
        );

        let mut headers = HeaderMap::new();
        if let Some(token) = request.auth.session_token.as_deref() {
            headers.insert(
                "X-Parse-Session-Token",
                HeaderValue::from_str(token).map_err(ParseError::InvalidHeaderValue)?,
            );
        } else if request.auth.use_master_key {
            match &self.master_key {
                Some(master_key) => {
                    headers.insert(
                        "X-Parse-Master-Key",
                        HeaderValue::from_str(master_key).map_err(ParseError::InvalidHeaderValue)?,
                    );
                }
                None => {
                    log::warn!("Master key requested for operation but not configured for the client.");
                    return Err(ParseError::MasterKeyRequired(
                        "Master key is required for this operation but not configured on the client."
                            .to_string(),
                    ));
                }
            }
        }

        let mut request_builder = self
            .http_client
            .request(request.method.clone(), full_url.clone());

        if let Some(body) = &request.body {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            let body_str = serde_json::to_string(body)?;
            log::debug!("Request body: {}", body_str);
            request_builder = request_builder.body(body_str);
        }

        let response = request_builder
            .headers(headers)
            .send()
            .await
            .map_err(ParseError::ReqwestError)?;

        let status = response.status();
        let body_bytes = response.bytes().await.map_err(ParseError::ReqwestError)?;
        log::debug!(
            "Response from {}: status={}, body={}",
            full_url,
            status,
            String::from_utf8_lossy(&body_bytes)
        );

        if status.is_success() {
            if body_bytes.is_empty() {
                return Ok(Value::Object(Default::default()));
            }
            serde_json::from_slice(&body_bytes).map_err(|e| {
                log::error!(
                    "JSON Deserialization failed for successful response from '{}'. Status: {}. Error: {}",
                    full_url,
                    status,
                    e
                );
                ParseError::JsonDeserializationFailed(format!(
                    "Failed to deserialize successful response from '{}': {}",
                    full_url, e
                ))
            })
        } else {
            let parsed_body: Value = serde_json::from_slice(&body_bytes).unwrap_or_else(|_| {
                log::warn!(
                    "Failed to parse error response body as JSON from '{}'. Status: {}",
                    full_url,
                    status
                );
                serde_json::json!({
                    "error": format!("HTTP Error {} with non-JSON body", status),
                })
            });
            Err(ParseError::from_response(status.as_u16(), parsed_body))
        }
    }
}
