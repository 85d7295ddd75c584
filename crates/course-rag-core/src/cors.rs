//! Cross-origin policy decisions.
//!
//! The policy is an explicit allow-list of exact origins
//! (scheme + host + port). The HTTP layer asks [`CorsPolicy::decide`] for
//! every request and stamps the header set returned by
//! [`CorsPolicy::response_headers`] or [`CorsPolicy::preflight_headers`].
//!
//! The allowed origin is always echoed back verbatim; a literal `*` entry in
//! the allow-list admits every origin but still echoes the concrete one, so
//! the `Access-Control-Allow-Origin` header is never a wildcard.

/// Headers a browser script may read from our responses.
pub const DEFAULT_EXPOSE_HEADERS: &[&str] = &[
    "X-RateLimit-Limit",
    "X-RateLimit-Remaining",
    "X-RateLimit-Reset",
    "Retry-After",
    "X-Version",
    "X-Service",
];

/// Result of checking a request's `Origin` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginDecision {
    /// Allowed; carries the origin to echo (`None` when the request had no
    /// `Origin` header).
    Allowed(Option<String>),
    Denied,
}

impl OriginDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, OriginDecision::Allowed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorsPolicy {
    allowed_origins: Vec<String>,
    /// Whether requests without an `Origin` header (same-origin navigation,
    /// server-to-server callers) pass the guard.
    pub allow_missing_origin: bool,
    pub allow_methods: Vec<String>,
    pub allow_headers: Vec<String>,
    pub expose_headers: Vec<String>,
    pub max_age_secs: u64,
}

impl Default for CorsPolicy {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            allow_missing_origin: true,
            allow_methods: vec!["GET".into(), "POST".into(), "OPTIONS".into()],
            allow_headers: vec!["Content-Type".into()],
            expose_headers: DEFAULT_EXPOSE_HEADERS.iter().map(|h| h.to_string()).collect(),
            max_age_secs: 86_400,
        }
    }
}

impl CorsPolicy {
    /// Policy with the default header sets and the given allow-list.
    ///
    /// Entries are trimmed and lose a trailing `/`, so
    /// `"https://catalog.example.edu/"` matches the browser-sent
    /// `"https://catalog.example.edu"`.
    pub fn new<I, S>(allowed_origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed_origins: allowed_origins
                .into_iter()
                .map(|o| o.as_ref().trim().trim_end_matches('/').to_string())
                .filter(|o| !o.is_empty())
                .collect(),
            ..Self::default()
        }
    }

    pub fn allowed_origins(&self) -> &[String] {
        &self.allowed_origins
    }

    pub fn decide(&self, origin: Option<&str>) -> OriginDecision {
        let Some(origin) = origin else {
            return if self.allow_missing_origin {
                OriginDecision::Allowed(None)
            } else {
                OriginDecision::Denied
            };
        };

        let listed = self
            .allowed_origins
            .iter()
            .any(|allowed| allowed == "*" || allowed == origin);
        if listed {
            OriginDecision::Allowed(Some(origin.to_string()))
        } else {
            OriginDecision::Denied
        }
    }

    /// Headers attached to every non-preflight response.
    ///
    /// `Access-Control-Allow-Origin` is only present when there is an
    /// allowed origin to echo. `Vary: Origin` is sent whenever the answer
    /// depends on the origin, including denials and requests without one.
    pub fn response_headers(&self, decision: &OriginDecision) -> Vec<(&'static str, String)> {
        let mut headers = Vec::with_capacity(5);
        let echoed = match decision {
            OriginDecision::Allowed(Some(origin)) => Some(origin.clone()),
            _ => None,
        };
        if echoed.is_some() || !self.allowed_origins.is_empty() {
            headers.push(("Vary", "Origin".to_string()));
        }
        if let Some(origin) = echoed {
            headers.push(("Access-Control-Allow-Origin", origin));
        }
        headers.push(("Access-Control-Allow-Methods", self.allow_methods.join(", ")));
        headers.push(("Access-Control-Allow-Headers", self.allow_headers.join(", ")));
        headers.push((
            "Access-Control-Expose-Headers",
            self.expose_headers.join(", "),
        ));
        headers
    }

    /// Headers for a preflight (`OPTIONS` + `Access-Control-Request-Method`)
    /// answer: the response set plus `Access-Control-Max-Age`.
    pub fn preflight_headers(&self, decision: &OriginDecision) -> Vec<(&'static str, String)> {
        let mut headers = self.response_headers(decision);
        headers.push(("Access-Control-Max-Age", self.max_age_secs.to_string()));
        headers
    }
}
