//! Same-Origin Policy (SOP) enforcement between windows
//!
//! Implements origin comparison per HTML specification section 7.5
//! https://html.spec.whatwg.org/multipage/origin.html
//!
//! Pages loaded from `file://` share the origin `file://` for domain checks
//! but report the opaque string `"null"` as the origin of the messages they
//! post, as browsers do.

use regex::Regex;
use std::fmt;

/// Origin string browsers report for messages posted by opaque origins.
pub const OPAQUE_ORIGIN: &str = "null";

/// Target origin that matches any receiver.
pub const WILDCARD: &str = "*";

/// Represents an origin tuple (scheme, host, port)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    /// URL scheme (e.g., "https", "http", "file")
    pub scheme: String,
    /// Host (e.g., "example.com", "localhost"); empty for `file`
    pub host: String,
    /// Port number (None means default port for scheme)
    pub port: Option<u16>,
}

impl Origin {
    /// Create a new origin
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            scheme: scheme.into().to_lowercase(),
            host: host.into().to_lowercase(),
            port,
        }
    }

    /// Parse an origin from a URL string
    ///
    /// # Examples
    ///
    /// ```
    /// use web_platform::Origin;
    ///
    /// let origin = Origin::parse("https://pay.example.com:443/checkout?x=1").unwrap();
    /// assert_eq!(origin.serialize(), "https://pay.example.com");
    ///
    /// let file = Origin::parse("file:///tmp/page.html").unwrap();
    /// assert!(file.is_file());
    /// assert_eq!(file.serialize(), "file://");
    /// ```
    pub fn parse(url: &str) -> Result<Self, OriginError> {
        let url = url.trim();
        if url == OPAQUE_ORIGIN {
            return Err(OriginError::OpaqueOrigin);
        }

        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| OriginError::InvalidUrl(format!("Missing scheme in {url}")))?;
        if scheme.is_empty() {
            return Err(OriginError::InvalidUrl("Empty scheme".to_string()));
        }
        if scheme.eq_ignore_ascii_case("file") {
            return Ok(Origin::new("file", "", None));
        }

        let authority = rest
            .split(|c: char| c == '/' || c == '?' || c == '#')
            .next()
            .unwrap_or(rest);

        // Drop userinfo (user:pass@host)
        let host_port = match authority.rsplit_once('@') {
            Some((_userinfo, hp)) => hp,
            None => authority,
        };

        let (host, port) = if host_port.starts_with('[') {
            if let Some((ipv6, port_str)) = host_port.rsplit_once("]:") {
                (format!("{}]", ipv6), Some(parse_port(port_str)?))
            } else if host_port.ends_with(']') {
                (host_port.to_string(), None)
            } else {
                return Err(OriginError::InvalidUrl("Malformed IPv6 address".to_string()));
            }
        } else if let Some((h, p)) = host_port.rsplit_once(':') {
            (h.to_string(), Some(parse_port(p)?))
        } else {
            (host_port.to_string(), None)
        };

        if host.is_empty() {
            return Err(OriginError::InvalidUrl("Empty host".to_string()));
        }

        Ok(Origin::new(scheme, host, port))
    }

    /// Get the effective port (resolving default ports)
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| default_port(&self.scheme))
    }

    /// Returns true for pages loaded from the local file system.
    pub fn is_file(&self) -> bool {
        self.scheme == "file"
    }

    /// Returns true for origins of the in-page mock channel.
    pub fn is_mock(&self) -> bool {
        self.scheme == "mock"
    }

    /// Check if this origin is same-origin with another
    ///
    /// Two origins are same-origin if:
    /// 1. Their schemes are identical (case-insensitive)
    /// 2. Their hosts are identical (case-insensitive)
    /// 3. Their ports are identical (with defaults applied)
    pub fn is_same_origin(&self, other: &Origin) -> bool {
        self.scheme == other.scheme
            && self.host == other.host
            && self.effective_port() == other.effective_port()
    }

    /// Serialize origin to string
    pub fn serialize(&self) -> String {
        match self.port {
            _ if self.is_file() => "file://".to_string(),
            Some(port) if port != default_port(&self.scheme) => {
                format!("{}://{}:{}", self.scheme, self.host, port)
            }
            _ => format!("{}://{}", self.scheme, self.host),
        }
    }

    /// The origin a browser attaches to messages posted from this origin.
    pub fn event_origin(&self) -> String {
        if self.is_file() {
            OPAQUE_ORIGIN.to_string()
        } else {
            self.serialize()
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.serialize())
    }
}

fn parse_port(port: &str) -> Result<u16, OriginError> {
    port.parse::<u16>()
        .map_err(|_| OriginError::InvalidUrl(format!("Invalid port {port}")))
}

/// Default ports for common schemes
fn default_port(scheme: &str) -> u16 {
    match scheme {
        "http" => 80,
        "https" => 443,
        "ws" => 80,
        "wss" => 443,
        "ftp" => 21,
        _ => 0,
    }
}

/// Errors that can occur during origin operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OriginError {
    /// The URL is invalid
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    /// The origin is opaque (null)
    #[error("Opaque origin")]
    OpaqueOrigin,
    /// Cross-origin access denied
    #[error("Blocked a frame with origin \"{viewer}\" from accessing a cross-origin frame at \"{target}\"")]
    CrossOriginDenied {
        /// Origin of the accessing window
        viewer: String,
        /// Origin of the window being accessed
        target: String,
    },
}

/// Same-Origin Policy enforcement context
#[derive(Debug, Clone)]
pub struct SameOriginPolicy {
    /// The viewing document's origin
    current_origin: Origin,
}

impl SameOriginPolicy {
    /// Create a new SOP enforcement context
    pub fn new(origin: Origin) -> Self {
        Self {
            current_origin: origin,
        }
    }

    /// Check if access to target origin is allowed
    pub fn check_access(&self, target: &Origin) -> Result<(), OriginError> {
        if self.current_origin.is_same_origin(target) {
            Ok(())
        } else {
            Err(OriginError::CrossOriginDenied {
                viewer: self.current_origin.serialize(),
                target: target.serialize(),
            })
        }
    }

    /// Check if a URL is same-origin
    pub fn is_same_origin_url(&self, url: &str) -> bool {
        Origin::parse(url)
            .map(|o| self.current_origin.is_same_origin(&o))
            .unwrap_or(false)
    }

    /// Get the current origin
    pub fn origin(&self) -> &Origin {
        &self.current_origin
    }
}

/// The set of origins a sender or listener accepts.
///
/// # Examples
///
/// ```
/// use web_platform::DomainMatcher;
///
/// let any = DomainMatcher::Any;
/// assert!(any.matches("https://anything.example"));
///
/// let pattern = DomainMatcher::pattern(r"^https://[a-z]+\.paypal\.com$").unwrap();
/// assert!(pattern.matches("https://www.paypal.com"));
/// assert!(!pattern.matches("https://paypal.com.evil.example"));
/// ```
#[derive(Debug, Clone, Default)]
pub enum DomainMatcher {
    /// `*`: any origin
    #[default]
    Any,
    /// Exactly one origin
    Exact(String),
    /// Any of the listed origins
    OneOf(Vec<String>),
    /// Origins matching a regular expression
    Pattern(Regex),
}

impl DomainMatcher {
    /// Compiles a pattern matcher.
    pub fn pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(DomainMatcher::Pattern(Regex::new(pattern)?))
    }

    /// Returns true if `origin` is accepted.
    pub fn matches(&self, origin: &str) -> bool {
        match self {
            DomainMatcher::Any => true,
            DomainMatcher::Exact(domain) => domain == WILDCARD || domain == origin,
            DomainMatcher::OneOf(domains) => domains.iter().any(|d| d == WILDCARD || d == origin),
            DomainMatcher::Pattern(regex) => regex.is_match(origin),
        }
    }

    /// Returns true if every origin is accepted.
    pub fn is_any(&self) -> bool {
        match self {
            DomainMatcher::Any => true,
            DomainMatcher::Exact(domain) => domain == WILDCARD,
            _ => false,
        }
    }

    /// The `target_origin` arguments a direct post needs to reach every
    /// accepted origin.
    ///
    /// Origins a browser cannot name as a post target (file pages, the mock
    /// channel, patterns) are reached with `*`.
    pub fn post_targets(&self) -> Vec<String> {
        let targetable = |domain: &str| {
            if domain.starts_with("file:") || domain.starts_with("mock:") {
                WILDCARD.to_string()
            } else {
                domain.to_string()
            }
        };
        let mut targets: Vec<String> = match self {
            DomainMatcher::Any | DomainMatcher::Pattern(_) => vec![WILDCARD.to_string()],
            DomainMatcher::Exact(domain) => vec![targetable(domain)],
            DomainMatcher::OneOf(domains) => domains.iter().map(|d| targetable(d)).collect(),
        };
        targets.dedup();
        targets
    }
}

impl From<&str> for DomainMatcher {
    fn from(domain: &str) -> Self {
        if domain == WILDCARD {
            DomainMatcher::Any
        } else {
            DomainMatcher::Exact(domain.to_string())
        }
    }
}

impl From<String> for DomainMatcher {
    fn from(domain: String) -> Self {
        DomainMatcher::from(domain.as_str())
    }
}

impl From<Vec<String>> for DomainMatcher {
    fn from(domains: Vec<String>) -> Self {
        DomainMatcher::OneOf(domains)
    }
}

impl From<Regex> for DomainMatcher {
    fn from(regex: Regex) -> Self {
        DomainMatcher::Pattern(regex)
    }
}

impl fmt::Display for DomainMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainMatcher::Any => f.write_str(WILDCARD),
            DomainMatcher::Exact(domain) => f.write_str(domain),
            DomainMatcher::OneOf(domains) => write!(f, "[{}]", domains.join(", ")),
            DomainMatcher::Pattern(regex) => write!(f, "/{}/", regex.as_str()),
        }
    }
}
