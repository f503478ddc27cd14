// src/client.rs

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::EntityCache;
use crate::error::ParseError;
use crate::live_query::{LiveConnector, LiveQueryClient, LiveQueryOptions, WsConnector};
use crate::registry::ClassRegistry;
use crate::requests::{HttpTransport, Method, RestRequest, Transport};

/// Requests that take longer than this fail with [`ParseError::Timeout`].
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The main client for interacting with a Parse Server instance.
///
/// `Parse` holds the application credentials, the optional user session token,
/// the REST [`Transport`], the shared [`EntityCache`] that live-query events and
/// saves reconcile into, and the [`ClassRegistry`] used for typed decoding.
/// Cloning is cheap: the transport, cache and registry are shared.
///
/// ```rust,no_run
/// use parse_live::{Parse, ParseQuery};
/// # use parse_live::ParseError;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), ParseError> {
/// let client = Parse::new(
///     "http://localhost:1338/parse",
///     "myAppId",
///     None,
///     None,
///     Some("myMasterKey"),
/// )?;
///
/// let mut query = ParseQuery::new("GameScore");
/// query.equal_to("playerName", "Sean Plott")?.limit(10);
/// let scores = query.find(&client).await?;
/// # let _ = scores;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Parse {
    pub server_url: String,
    pub(crate) app_id: String,
    pub(crate) javascript_key: Option<String>,
    pub(crate) master_key: Option<String>,
    pub(crate) session_token: Option<String>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) cache: Arc<EntityCache>,
    pub(crate) registry: Arc<ClassRegistry>,
    pub(crate) request_timeout: Option<Duration>,
}

impl fmt::Debug for Parse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parse")
            .field("server_url", &self.server_url)
            .field("app_id", &self.app_id)
            .field("has_master_key", &self.master_key.is_some())
            .field("has_session_token", &self.session_token.is_some())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl Parse {
    /// Creates a client talking to `server_url` over HTTP.
    ///
    /// The URL is normalized (scheme added when missing, trailing `/parse`
    /// stripped). For default authentication the master key takes precedence
    /// over the JavaScript key, which takes precedence over the REST key; a
    /// session token set later overrides all of them per request.
    pub fn new(
        server_url: &str,
        app_id: &str,
        javascript_key: Option<&str>,
        rest_api_key: Option<&str>,
        master_key: Option<&str>,
    ) -> Result<Self, ParseError> {
        let transport =
            HttpTransport::new(server_url, app_id, javascript_key, rest_api_key, master_key)?;

        log::debug!(
            "Parse initialized with base server_url: {}",
            transport.server_url()
        );

        let mut client = Self::with_transport(app_id, Arc::new(transport.clone()));
        client.server_url = transport.server_url().to_string();
        client.javascript_key = javascript_key.map(str::to_string);
        client.master_key = master_key.map(str::to_string);
        Ok(client)
    }

    /// Reads `PARSE_SERVER_URL`, `PARSE_APP_ID` and the optional
    /// `PARSE_JAVASCRIPT_KEY`, `PARSE_REST_API_KEY`, `PARSE_MASTER_KEY`.
    pub fn from_env() -> Result<Self, ParseError> {
        let required = |name: &str| {
            std::env::var(name)
                .map_err(|_| ParseError::InvalidInput(format!("{} is not set", name)))
        };
        let optional = |name: &str| std::env::var(name).ok();

        let server_url = required("PARSE_SERVER_URL")?;
        let app_id = required("PARSE_APP_ID")?;
        let javascript_key = optional("PARSE_JAVASCRIPT_KEY");
        let rest_api_key = optional("PARSE_REST_API_KEY");
        let master_key = optional("PARSE_MASTER_KEY");

        Self::new(
            &server_url,
            &app_id,
            javascript_key.as_deref(),
            rest_api_key.as_deref(),
            master_key.as_deref(),
        )
    }

    /// Creates a client over a custom transport. Credentials other than the
    /// application id are the transport's concern.
    pub fn with_transport(app_id: &str, transport: Arc<dyn Transport>) -> Self {
        Self {
            server_url: String::new(),
            app_id: app_id.to_string(),
            javascript_key: None,
            master_key: None,
            session_token: None,
            transport,
            cache: Arc::new(EntityCache::new()),
            registry: Arc::new(ClassRegistry::new()),
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
        }
    }

    /// Overrides the per-request timeout; `None` disables it.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Returns the current session token, if one is set on the client.
    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    /// Sets or clears the session token sent with non-master-key requests and
    /// live-query subscriptions. Token issuance happens outside this crate.
    pub fn set_session_token(&mut self, token: Option<String>) {
        self.session_token = token;
    }

    pub fn is_authenticated(&self) -> bool {
        self.session_token.is_some()
    }

    /// The entity cache shared by saves and live-query subscriptions.
    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<ClassRegistry> {
        &self.registry
    }

    /// Opens a live-query channel over WebSocket at `url`
    /// (e.g. `ws://localhost:1337/parse`). Must be called inside a Tokio runtime.
    pub fn live_query(&self, url: &str) -> Result<LiveQueryClient, ParseError> {
        let connector = WsConnector::new(url)?;
        Ok(self.live_query_with(Arc::new(connector), LiveQueryOptions::default()))
    }

    /// Opens a live-query channel over a custom connector.
    pub fn live_query_with(
        &self,
        connector: Arc<dyn LiveConnector>,
        options: LiveQueryOptions,
    ) -> LiveQueryClient {
        LiveQueryClient::start(self, connector, options)
    }

    /// Sends a request through the transport, attaching the client's session
    /// token unless the request carries its own or uses the master key.
    pub(crate) async fn execute(&self, mut request: RestRequest) -> Result<Value, ParseError> {
        if request.auth.session_token.is_none() && !request.auth.use_master_key {
            request.auth.session_token = self.session_token.clone();
        }

        let method = request.method.clone();
        let path = request.path.clone();
        let fut = self.transport.send(request);
        let result = match self.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(ParseError::Timeout(limit)),
            },
            None => fut.await,
        };

        if let Err(e) = &result {
            log::warn!("{} {} failed: {}", method, path, e);
        }
        result
    }

    pub(crate) async fn execute_as<R: DeserializeOwned>(
        &self,
        request: RestRequest,
    ) -> Result<R, ParseError> {
        let value = self.execute(request).await?;
        serde_json::from_value(value)
            .map_err(|e| ParseError::JsonDeserializationFailed(e.to_string()))
    }
}
