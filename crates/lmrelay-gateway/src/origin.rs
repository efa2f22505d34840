//! Origin allow-listing for the chat endpoint
//!
//! Agents are trusted internal peers and are never checked. Browser clients
//! on the chat endpoint must present an `Origin` whose host matches one of the
//! configured patterns:
//!
//! - `*` allows any well-formed origin
//! - `example.com` allows exactly that host
//! - `*.example.com` allows `example.com` and any subdomain of it
//!
//! An empty pattern list disables validation entirely.

use thiserror::Error;
use url::Url;

/// Why an origin was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OriginDenied {
    #[error("missing origin")]
    MissingOrigin,
    #[error("invalid origin '{0}'")]
    InvalidOrigin(String),
    #[error("origin '{0}' not allowed")]
    NotAllowed(String),
}

/// Host patterns accepted on the chat endpoint
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    patterns: Vec<String>,
}

impl OriginPolicy {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| p.as_ref().trim().to_ascii_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        Self { patterns }
    }

    /// Whether any pattern is configured
    pub fn is_enabled(&self) -> bool {
        !self.patterns.is_empty()
    }

    /// Decide whether a connection declaring `origin` may join.
    ///
    /// Rules are evaluated in order and the first match wins.
    pub fn check(&self, origin: Option<&str>) -> Result<(), OriginDenied> {
        if !self.is_enabled() {
            return Ok(());
        }

        let origin = match origin.map(str::trim) {
            Some(o) if !o.is_empty() => o,
            _ => return Err(OriginDenied::MissingOrigin),
        };

        let host = Url::parse(origin)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
            .ok_or_else(|| OriginDenied::InvalidOrigin(origin.to_string()))?;

        if self.patterns.iter().any(|p| host_matches(p, &host)) {
            Ok(())
        } else {
            Err(OriginDenied::NotAllowed(origin.to_string()))
        }
    }

    /// Like [`check`](Self::check), for a raw header value. Bytes that do
    /// not form a visible-ASCII origin are invalid, not missing.
    pub fn check_raw(&self, origin: Option<&[u8]>) -> Result<(), OriginDenied> {
        let Some(bytes) = origin else {
            return self.check(None);
        };
        match std::str::from_utf8(bytes) {
            Ok(text) if text.is_ascii() => self.check(Some(text)),
            _ if !self.is_enabled() => Ok(()),
            _ => Err(OriginDenied::InvalidOrigin(
                String::from_utf8_lossy(bytes).into_owned(),
            )),
        }
    }
}

fn host_matches(pattern: &str, host: &str) -> bool {
    if pattern == "*" || pattern == host {
        return true;
    }
    match pattern.strip_prefix("*.") {
        Some(domain) => {
            host == domain
                || host
                    .strip_suffix(domain)
                    .is_some_and(|prefix| prefix.ends_with('.'))
        }
        None => false,
    }
}
