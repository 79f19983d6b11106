use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

/// Longest accepted domain socket name, `sun_path` minus some slack.
pub const MAX_UNIX_LEN: usize = 106;

/// Address the listener binds to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAddr {
    /// Linux abstract domain socket, stored without the leading `@`.
    Abstract(String),
    /// Domain socket at an absolute path.
    Unix(PathBuf),
    /// TCP port on the loopback interface.
    Tcp(SocketAddr),
}

impl fmt::Display for BindAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindAddr::Abstract(name) => write!(f, "@{name}"),
            BindAddr::Unix(path) => write!(f, "{}", path.display()),
            BindAddr::Tcp(addr) => write!(f, "{addr}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindAddrError {
    #[error("sock file length must be less than {MAX_UNIX_LEN} characters")]
    TooLong,
    #[error("sock file must be an absolute path")]
    RelativePath,
    #[error("invalid port {0:?} - must be between 1 and 65534")]
    InvalidPort(String),
}

/// Parse and validate a listener address.
///
/// `@name` is an abstract socket (Linux only), anything containing `/` is a
/// domain socket path and everything else must be a TCP port.
pub fn parse_bind_addr(s: &str) -> Result<BindAddr, BindAddrError> {
    if cfg!(target_os = "linux") {
        if let Some(name) = s.strip_prefix('@') {
            if s.len() > MAX_UNIX_LEN {
                return Err(BindAddrError::TooLong);
            }
            return Ok(BindAddr::Abstract(name.to_string()));
        }
    }

    if s.contains('/') {
        let path = Path::new(s);
        if !path.is_absolute() {
            return Err(BindAddrError::RelativePath);
        }
        if s.len() > MAX_UNIX_LEN {
            return Err(BindAddrError::TooLong);
        }
        return Ok(BindAddr::Unix(path.to_path_buf()));
    }

    // TCP is only supported on loopback.
    match s.parse::<u16>() {
        Ok(port) if (1..=65534).contains(&port) => {
            Ok(BindAddr::Tcp(SocketAddr::from((Ipv4Addr::LOCALHOST, port))))
        }
        _ => Err(BindAddrError::InvalidPort(s.to_string())),
    }
}
