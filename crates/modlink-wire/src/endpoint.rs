//! Connection strings: `<role>:<transport>://<address>`.

use crate::error::WireError;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Which side of the bus this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connects to a server and talks only to it.
    Client,
    /// Binds and fans in from many clients.
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

/// Where the socket lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// `tcp://host:port`; `*` as host means every interface.
    Tcp { host: String, port: u16 },
    /// `ipc:///path/to/socket` (Unix-domain socket).
    Ipc(PathBuf),
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp { host, port } if host.contains(':') => {
                write!(f, "tcp://[{host}]:{port}")
            }
            Transport::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Transport::Ipc(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}

/// A parsed connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub role: Role,
    pub transport: Transport,
}

impl Endpoint {
    /// Parse `<role>:<transport>://<address>`. The role is checked first.
    pub fn parse(s: &str) -> Result<Self, WireError> {
        let (role, rest) = s.split_once(':').unwrap_or((s, ""));
        let role = match role {
            "client" => Role::Client,
            "server" => Role::Server,
            other => {
                return Err(WireError::Config(format!(
                    "Unknown bus endpoint type {other} [correct types: client, server]!"
                )))
            }
        };

        let (scheme, address) = rest
            .split_once("://")
            .ok_or_else(|| WireError::Config(format!("Malformed bus address '{rest}'")))?;

        let transport = match scheme {
            "tcp" => parse_tcp(address)?,
            "ipc" => parse_ipc(address)?,
            other => {
                return Err(WireError::Config(format!(
                    "Unsupported transport '{other}' [supported: tcp, ipc]"
                )))
            }
        };

        Ok(Self { role, transport })
    }
}

fn parse_tcp(address: &str) -> Result<Transport, WireError> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| WireError::Config(format!("TCP address '{address}' has no port")))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| WireError::Config(format!("Invalid TCP port '{port}'")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let host = match host {
        "" => return Err(WireError::Config(format!("TCP address '{address}' has no host"))),
        "*" => "0.0.0.0",
        h => h,
    };
    Ok(Transport::Tcp {
        host: host.to_string(),
        port,
    })
}

fn parse_ipc(address: &str) -> Result<Transport, WireError> {
    if address.is_empty() {
        return Err(WireError::Config("IPC address has no path".to_string()));
    }
    if cfg!(not(unix)) {
        return Err(WireError::Config(
            "IPC transport requires Unix-domain sockets".to_string(),
        ));
    }
    Ok(Transport::Ipc(PathBuf::from(address)))
}

impl FromStr for Endpoint {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role, self.transport)
    }
}
