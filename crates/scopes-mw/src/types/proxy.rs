//! Proxy addressing
//!
//! A proxy string names one servant:
//!
//! ```text
//! ipc://<endpoint path>#<identity>[!c=<category>][!m=<o|t>][!t=<timeout ms>]
//! ```
//!
//! Optional fields may appear in any order but at most once each. Fields
//! holding their default value (category `Scope`, mode twoway, timeout -1)
//! are omitted from the canonical form, so canonical strings round-trip
//! through [`ProxyAddress::parse`] and [`fmt::Display`] unchanged.

use std::collections::BTreeMap;
use std::fmt;

use scopes_wire::{Endpoint, IPC_SCHEME};

use super::category::{Category, InvocationMode};
use super::error::{MwError, Result};

/// String form of the null proxy
pub const NULL_PROXY: &str = "nullproxy:";

/// Timeout value meaning "wait forever"
pub const INFINITE_TIMEOUT: i64 = -1;

const VALID_FIELDS: &str = "cmt";

/// Structured proxy description; purely textual, no I/O
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProxyAddress {
    endpoint: Endpoint,
    identity: String,
    category: Category,
    mode: InvocationMode,
    timeout: i64,
}

fn bad_proxy_string(msg: String) -> MwError {
    MwError::InvalidArgument(format!("string_to_proxy(): {}", msg))
}

impl ProxyAddress {
    /// Create a proxy description, rejecting values that could not be
    /// written as a proxy string.
    pub fn new(
        endpoint: Endpoint,
        identity: impl Into<String>,
        category: Category,
        mode: InvocationMode,
        timeout: i64,
    ) -> Result<Self> {
        let identity = identity.into();
        if identity.is_empty() {
            return Err(MwError::InvalidArgument("proxy identity cannot be empty".to_string()));
        }
        if identity.contains('!') {
            return Err(MwError::InvalidArgument(format!(
                "proxy identity cannot contain '!': {}",
                identity
            )));
        }
        if endpoint.path().to_string_lossy().contains('#') {
            return Err(MwError::InvalidArgument(format!(
                "proxy endpoint cannot contain '#': {}",
                endpoint
            )));
        }
        if timeout < INFINITE_TIMEOUT {
            return Err(MwError::InvalidArgument(format!("invalid proxy timeout: {}", timeout)));
        }
        Ok(Self {
            endpoint,
            identity,
            category,
            mode,
            timeout,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn mode(&self) -> InvocationMode {
        self.mode
    }

    /// Timeout in milliseconds; -1 is infinite
    pub fn timeout(&self) -> i64 {
        self.timeout
    }

    pub fn with_timeout(mut self, timeout: i64) -> Result<Self> {
        if timeout < INFINITE_TIMEOUT {
            return Err(MwError::InvalidArgument(format!("invalid proxy timeout: {}", timeout)));
        }
        self.timeout = timeout;
        Ok(self)
    }

    pub fn with_mode(mut self, mode: InvocationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Parse a proxy string; `"nullproxy:"` yields `None`.
    pub fn parse(s: &str) -> Result<Option<Self>> {
        if s == NULL_PROXY {
            return Ok(None);
        }
        if s.is_empty() {
            return Err(bad_proxy_string("proxy string cannot be empty".to_string()));
        }
        if !s.starts_with(IPC_SCHEME) {
            return Err(bad_proxy_string(format!(
                "invalid proxy scheme prefix: \"{}\" (expected \"{}\")",
                s, IPC_SCHEME
            )));
        }
        let fragment_pos = s
            .find('#')
            .ok_or_else(|| bad_proxy_string(format!("invalid proxy: missing # separator: {}", s)))?;

        let endpoint_str = &s[..fragment_pos];
        if endpoint_str.len() == IPC_SCHEME.len() {
            return Err(bad_proxy_string(format!("invalid proxy: empty endpoint path: {}", s)));
        }
        let endpoint: Endpoint = endpoint_str
            .parse()
            .map_err(|e| bad_proxy_string(format!("invalid proxy endpoint: {}: {}", e, s)))?;

        let fields = &s[fragment_pos + 1..];
        let (identity, rest) = match fields.find('!') {
            Some(pos) => (&fields[..pos], Some(&fields[pos + 1..])),
            None => (fields, None),
        };
        if identity.is_empty() {
            return Err(bad_proxy_string(format!("invalid proxy: empty identity: {}", s)));
        }

        // Collect field assignments, rejecting duplicates.
        let mut fmap: BTreeMap<char, &str> = BTreeMap::new();
        if let Some(rest) = rest {
            for field in rest.split('!') {
                if field.is_empty() {
                    return Err(bad_proxy_string(format!(
                        "invalid proxy: invalid empty field specification: {}",
                        s
                    )));
                }
                let mut chars = field.chars();
                let key = chars.next().unwrap_or_default();
                if chars.next() != Some('=') {
                    return Err(bad_proxy_string(format!(
                        "invalid proxy: bad field specification (\"{}\"): {}",
                        field, s
                    )));
                }
                if !VALID_FIELDS.contains(key) {
                    return Err(bad_proxy_string(format!(
                        "invalid proxy: invalid field identifier (\"{}\"): {}",
                        field, s
                    )));
                }
                if fmap.contains_key(&key) {
                    return Err(bad_proxy_string(format!(
                        "invalid proxy: duplicate field specification (\"{}=\"): {}",
                        key, s
                    )));
                }
                fmap.insert(key, &field[key.len_utf8() + 1..]);
            }
        }

        let mut category = Category::Scope;
        let mut mode = InvocationMode::Twoway;
        let mut timeout = INFINITE_TIMEOUT;
        for (key, value) in fmap {
            match key {
                'c' => {
                    category = value.parse().map_err(|_| {
                        bad_proxy_string(format!("invalid proxy: unknown category (\"c={}\"): {}", value, s))
                    })?;
                }
                'm' => {
                    mode = InvocationMode::from_code(value).ok_or_else(|| {
                        bad_proxy_string(format!("invalid proxy: bad mode (\"m={}\"): {}", value, s))
                    })?;
                }
                't' => {
                    timeout = value
                        .parse::<i64>()
                        .ok()
                        .filter(|t| *t >= INFINITE_TIMEOUT)
                        .ok_or_else(|| {
                            bad_proxy_string(format!("invalid proxy: bad timeout value (\"t={}\"): {}", value, s))
                        })?;
                }
                _ => unreachable!("field keys are restricted to {}", VALID_FIELDS),
            }
        }

        Self::new(endpoint, identity, category, mode, timeout).map(Some)
    }

    /// Format a proxy; the null proxy formats to `"nullproxy:"`.
    pub fn format(proxy: Option<&ProxyAddress>) -> String {
        match proxy {
            Some(p) => p.to_string(),
            None => NULL_PROXY.to_string(),
        }
    }
}

impl fmt::Display for ProxyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.endpoint, self.identity)?;
        if self.category != Category::Scope {
            write!(f, "!c={}", self.category)?;
        }
        if self.mode != InvocationMode::Twoway {
            write!(f, "!m={}", self.mode.code())?;
        }
        if self.timeout != INFINITE_TIMEOUT {
            write!(f, "!t={}", self.timeout)?;
        }
        Ok(())
    }
}
