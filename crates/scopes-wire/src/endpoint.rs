//! Endpoint addressing
//!
//! Endpoints name a Unix-domain socket: `ipc://<filesystem path>`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, WireError};

/// Scheme prefix accepted for endpoints
pub const IPC_SCHEME: &str = "ipc://";

/// Longest socket path the kernel accepts (sun_path minus the terminator)
pub const MAX_SOCKET_PATH: usize = 107;

/// A local socket endpoint
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    path: PathBuf,
}

impl Endpoint {
    /// Endpoint for a socket named `name` inside `dir`
    pub fn in_dir(dir: &Path, name: &str) -> Self {
        Self {
            path: dir.join(name),
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check that the path fits into a socket address.
    pub fn validate(&self) -> Result<()> {
        let len = self.path.as_os_str().len();
        if len == 0 {
            return Err(WireError::InvalidEndpoint("empty socket path".to_string()));
        }
        if len > MAX_SOCKET_PATH {
            return Err(WireError::InvalidEndpoint(format!(
                "socket path too long ({} > {}): {}",
                len,
                MAX_SOCKET_PATH,
                self.path.display()
            )));
        }
        Ok(())
    }
}

impl FromStr for Endpoint {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self> {
        let path = s.strip_prefix(IPC_SCHEME).ok_or_else(|| {
            WireError::InvalidEndpoint(format!("expected \"{}\" prefix: {}", IPC_SCHEME, s))
        })?;
        if path.is_empty() {
            return Err(WireError::InvalidEndpoint(format!("empty endpoint path: {}", s)));
        }
        Ok(Self {
            path: PathBuf::from(path),
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", IPC_SCHEME, self.path.display())
    }
}
