//! Client options and their synchronous validation.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use percent_encoding::percent_decode_str;
use url::Url;
use uuid::Uuid;

use crate::utils::{ClientError, Result};

pub const DEFAULT_SERVICE: &str = "amqp://localhost";

/// How long `stop` waits for running handlers to settle their deliveries.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_CLIENT_ID_LEN: usize = 256;

/// Options accepted by [`Client::new`](super::Client::new).
///
/// Services are tried in the order given each time the client starts.
#[derive(Clone)]
pub struct ClientOptions {
    pub services: Vec<String>,
    pub id: Option<String>,
    pub ssl_trust_certificate: Option<PathBuf>,
    pub drain_timeout: Duration,
}

impl ClientOptions {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            services: vec![service.into()],
            id: None,
            ssl_trust_certificate: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Adds a fallback service, tried after the ones already configured.
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.services.push(service.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_trust_certificate(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssl_trust_certificate = Some(path.into());
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Checks every option without touching the network.
    pub fn validate(&self) -> Result<ValidatedOptions> {
        if self.services.is_empty() {
            return Err(ClientError::configuration(
                "service",
                "at least one service URL is required",
            ));
        }
        let endpoints = self
            .services
            .iter()
            .map(|s| ServiceUrl::parse(s))
            .collect::<Result<Vec<_>>>()?;

        if let Some(cert) = &self.ssl_trust_certificate {
            if let Some(insecure) = endpoints.iter().find(|e| !e.is_secure()) {
                return Err(ClientError::configuration(
                    "ssl_trust_certificate",
                    format!(
                        "service URL '{insecure}' must start 'amqps://' or 'wss://' when a trust certificate is used"
                    ),
                ));
            }
            check_certificate_file(cert)?;
        }

        let client_id = match &self.id {
            Some(id) => validate_client_id(id)?,
            None => generate_client_id(),
        };

        Ok(ValidatedOptions {
            endpoints,
            client_id,
            trust_certificate: self.ssl_trust_certificate.clone(),
            drain_timeout: self.drain_timeout,
        })
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE)
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // services may embed passwords
        let services: Vec<String> = self
            .services
            .iter()
            .map(|s| match ServiceUrl::parse(s) {
                Ok(url) => url.to_string(),
                Err(_) => "<invalid>".to_string(),
            })
            .collect();
        f.debug_struct("ClientOptions")
            .field("services", &services)
            .field("id", &self.id)
            .field("ssl_trust_certificate", &self.ssl_trust_certificate)
            .field("drain_timeout", &self.drain_timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ValidatedOptions {
    pub endpoints: Vec<ServiceUrl>,
    pub client_id: String,
    pub trust_certificate: Option<PathBuf>,
    pub drain_timeout: Duration,
}

fn check_certificate_file(path: &Path) -> Result<()> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(ClientError::configuration(
            "ssl_trust_certificate",
            format!("'{}' is not a regular file", path.display()),
        )),
        Err(e) => Err(ClientError::configuration(
            "ssl_trust_certificate",
            format!("cannot read '{}': {e}", path.display()),
        )),
    }
}

pub fn validate_client_id(id: &str) -> Result<String> {
    if id.is_empty() || id.chars().count() > MAX_CLIENT_ID_LEN {
        return Err(ClientError::configuration(
            "id",
            format!("client id must be between 1 and {MAX_CLIENT_ID_LEN} characters"),
        ));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '%' | '/' | '.' | '_')))
    {
        return Err(ClientError::configuration(
            "id",
            format!("client id '{id}' contains invalid character '{bad}'"),
        ));
    }
    Ok(id.to_string())
}

/// `AUTO_` followed by seven hex characters.
pub fn generate_client_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("AUTO_{}", &hex[..7])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Amqp,
    Amqps,
    Ws,
    Wss,
}

impl Scheme {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "amqp" => Some(Self::Amqp),
            "amqps" => Some(Self::Amqps),
            "ws" => Some(Self::Ws),
            "wss" => Some(Self::Wss),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Amqp => "amqp",
            Self::Amqps => "amqps",
            Self::Ws => "ws",
            Self::Wss => "wss",
        }
    }

    fn default_port(self) -> u16 {
        match self {
            Self::Amqp => 5672,
            Self::Amqps => 5671,
            Self::Ws => 80,
            Self::Wss => 443,
        }
    }

    pub fn is_secure(self) -> bool {
        matches!(self, Self::Amqps | Self::Wss)
    }
}

/// A validated broker endpoint.
///
/// `Display` never shows the password.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceUrl {
    scheme: Scheme,
    host: String,
    port: u16,
    path: String,
    username: Option<String>,
    password: Option<String>,
}

impl ServiceUrl {
    pub fn parse(service: &str) -> Result<Self> {
        let invalid = |reason: String| ClientError::configuration("service", reason);

        let url = Url::parse(service)
            .map_err(|e| invalid(format!("'{service}' is not a valid URL: {e}")))?;
        let shown = redact(&url);
        let scheme = Scheme::parse(url.scheme()).ok_or_else(|| {
            invalid(format!(
                "unsupported scheme '{}' in '{shown}', expected amqp, amqps, ws or wss",
                url.scheme()
            ))
        })?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid(format!("'{shown}' does not name a host")))?
            .to_string();

        let path = url.path().to_string();
        if matches!(scheme, Scheme::Amqp | Scheme::Amqps) && !(path.is_empty() || path == "/") {
            return Err(invalid(format!(
                "'{shown}' has a path; paths are not supported for {} services",
                scheme.as_str()
            )));
        }

        let username = decode_userinfo(url.username(), "user name", &shown)?;
        let password = match url.password() {
            Some(raw) => decode_userinfo(raw, "password", &shown)?,
            None => None,
        };
        if username.is_some() != password.is_some() {
            return Err(invalid(format!(
                "'{shown}' must specify both a user name and a password, or neither"
            )));
        }

        Ok(Self {
            scheme,
            port: url.port().unwrap_or_else(|| scheme.default_port()),
            host,
            path,
            username,
            password,
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn is_secure(&self) -> bool {
        self.scheme.is_secure()
    }

    /// The WebSocket URL the broker protocol is carried over.
    pub fn websocket_url(&self) -> String {
        let scheme = if self.is_secure() { "wss" } else { "ws" };
        let path = if self.path.is_empty() { "/" } else { &self.path };
        format!("{scheme}://{}:{}{path}", self.host_for_url(), self.port)
    }

    fn host_for_url(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

impl fmt::Display for ServiceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme.as_str())?;
        if let Some(user) = &self.username {
            write!(f, "{user}:********@")?;
        }
        write!(f, "{}:{}", self.host_for_url(), self.port)?;
        if !self.path.is_empty() && self.path != "/" {
            write!(f, "{}", self.path)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ServiceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceUrl({self})")
    }
}

fn decode_userinfo(raw: &str, part: &str, shown: &str) -> Result<Option<String>> {
    if raw.is_empty() {
        return Ok(None);
    }
    percent_decode_str(raw)
        .decode_utf8()
        .map(|decoded| Some(decoded.into_owned()))
        .map_err(|e| {
            ClientError::configuration("service", format!("{part} in '{shown}' is not valid UTF-8: {e}"))
        })
}

fn redact(url: &Url) -> String {
    let mut shown = url.clone();
    if shown.password().is_some() {
        let _ = shown.set_password(Some("********"));
    }
    shown.to_string()
}
