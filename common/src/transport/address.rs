// Socket address parsing and connection helpers shared by the gRPC binding

use crate::errors::TransportError;
use hyper_util::rt::TokioIo;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use tokio::net::{UnixListener, UnixStream};
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

/// Where a dispatcher or worker endpoint lives
///
/// Accepts `unix:<path>`, `unix://<path>`, `unix:@<name>`, `unix-abstract:<name>`,
/// `@<name>`, absolute paths, `http(s)://host:port` and bare `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketAddress {
    Tcp(String),
    Unix(PathBuf),
    /// Linux abstract namespace socket, name without the leading `@`
    Abstract(String),
}

impl FromStr for SocketAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(TransportError::Connection("empty socket address".to_string()));
        }

        if s.starts_with("http://") || s.starts_with("https://") {
            return Ok(SocketAddress::Tcp(s.to_string()));
        }

        if let Some(name) = s.strip_prefix("unix-abstract:") {
            return abstract_name(name);
        }

        let rest = s
            .strip_prefix("unix://")
            .or_else(|| s.strip_prefix("unix:"))
            .unwrap_or(s);

        if let Some(name) = rest.strip_prefix('@') {
            return abstract_name(name);
        }

        if rest.starts_with('/') || rest != s {
            return Ok(SocketAddress::Unix(PathBuf::from(rest)));
        }

        Ok(SocketAddress::Tcp(format!("http://{}", rest)))
    }
}

fn abstract_name(name: &str) -> Result<SocketAddress, TransportError> {
    if name.is_empty() {
        return Err(TransportError::Connection(
            "empty abstract socket name".to_string(),
        ));
    }
    Ok(SocketAddress::Abstract(name.to_string()))
}

impl std::fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketAddress::Tcp(uri) => write!(f, "{}", uri),
            SocketAddress::Unix(path) => write!(f, "unix:{}", path.display()),
            SocketAddress::Abstract(name) => write!(f, "unix:@{}", name),
        }
    }
}

impl SocketAddress {
    /// Build a lazily connecting gRPC channel; failures surface on first call
    pub fn channel(&self) -> Result<Channel, TransportError> {
        match self {
            SocketAddress::Tcp(uri) => Ok(Endpoint::from_shared(uri.clone())
                .map_err(|e| TransportError::Connection(format!("Invalid endpoint: {}", e)))?
                .connect_lazy()),
            unix => {
                let target = unix.clone();
                // The URI is ignored by the connector; tonic still requires a valid one
                let endpoint = Endpoint::from_static("http://[::]:50051");
                Ok(endpoint.connect_with_connector_lazy(service_fn(move |_: Uri| {
                    let target = target.clone();
                    async move { target.connect_unix().await.map(TokioIo::new) }
                })))
            }
        }
    }

    async fn connect_unix(&self) -> io::Result<UnixStream> {
        match self {
            SocketAddress::Unix(path) => UnixStream::connect(path).await,
            SocketAddress::Abstract(name) => connect_abstract(name),
            SocketAddress::Tcp(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a unix socket address",
            )),
        }
    }

    /// Bind a unix listener for this address
    pub fn bind_unix(&self) -> Result<UnixListener, TransportError> {
        let bind_error = |e: io::Error| TransportError::Bind {
            address: self.to_string(),
            reason: e.to_string(),
        };

        match self {
            SocketAddress::Unix(path) => UnixListener::bind(path).map_err(bind_error),
            SocketAddress::Abstract(name) => bind_abstract(name).map_err(bind_error),
            SocketAddress::Tcp(_) => Err(bind_error(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a unix socket address",
            ))),
        }
    }

    /// `host:port` part of a TCP address
    pub fn tcp_authority(&self) -> Option<&str> {
        match self {
            SocketAddress::Tcp(uri) => {
                let without_scheme = uri.split("://").nth(1).unwrap_or(uri.as_str());
                Some(without_scheme.trim_end_matches('/'))
            }
            _ => None,
        }
    }
}

#[cfg(target_os = "linux")]
fn connect_abstract(name: &str) -> io::Result<UnixStream> {
    use std::os::linux::net::SocketAddrExt;

    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    let stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
    stream.set_nonblocking(true)?;
    UnixStream::from_std(stream)
}

#[cfg(target_os = "linux")]
fn bind_abstract(name: &str) -> io::Result<UnixListener> {
    use std::os::linux::net::SocketAddrExt;

    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    let listener = std::os::unix::net::UnixListener::bind_addr(&addr)?;
    listener.set_nonblocking(true)?;
    UnixListener::from_std(listener)
}

#[cfg(not(target_os = "linux"))]
fn connect_abstract(_name: &str) -> io::Result<UnixStream> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract unix sockets require Linux",
    ))
}

#[cfg(not(target_os = "linux"))]
fn bind_abstract(_name: &str) -> io::Result<UnixListener> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract unix sockets require Linux",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> SocketAddress {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_unix_variants() {
        assert_eq!(
            parse("unix:/run/yggd.sock"),
            SocketAddress::Unix(PathBuf::from("/run/yggd.sock"))
        );
        assert_eq!(
            parse("unix:///run/yggd.sock"),
            SocketAddress::Unix(PathBuf::from("/run/yggd.sock"))
        );
        assert_eq!(
            parse("/tmp/worker.sock"),
            SocketAddress::Unix(PathBuf::from("/tmp/worker.sock"))
        );
        assert_eq!(
            parse("unix:relative.sock"),
            SocketAddress::Unix(PathBuf::from("relative.sock"))
        );
    }

    #[test]
    fn test_parse_abstract_variants() {
        let expected = SocketAddress::Abstract("yggd-dispatcher".to_string());
        assert_eq!(parse("unix:@yggd-dispatcher"), expected);
        assert_eq!(parse("@yggd-dispatcher"), expected);
        assert_eq!(parse("unix-abstract:yggd-dispatcher"), expected);
        assert!("unix:@".parse::<SocketAddress>().is_err());
    }

    #[test]
    fn test_parse_tcp_variants() {
        assert_eq!(
            parse("http://127.0.0.1:4000"),
            SocketAddress::Tcp("http://127.0.0.1:4000".to_string())
        );
        assert_eq!(
            parse("localhost:4000"),
            SocketAddress::Tcp("http://localhost:4000".to_string())
        );
        assert_eq!(
            parse("http://127.0.0.1:4000").tcp_authority(),
            Some("127.0.0.1:4000")
        );
    }

    #[test]
    fn test_empty_address_rejected() {
        assert!("  ".parse::<SocketAddress>().is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        for raw in ["unix:@worker", "unix:/tmp/w.sock", "http://127.0.0.1:1"] {
            assert_eq!(parse(raw).to_string(), raw);
        }
    }

    #[tokio::test]
    async fn test_bind_and_connect_path_socket() {
        let dir = tempfile::tempdir().unwrap();
        let address = SocketAddress::Unix(dir.path().join("worker.sock"));

        let listener = address.bind_unix().unwrap();
        let (accepted, connected) = tokio::join!(listener.accept(), address.connect_unix());
        assert!(accepted.is_ok());
        assert!(connected.is_ok());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_bind_and_connect_abstract_socket() {
        let name = format!("foreman-test-{}", uuid::Uuid::new_v4());
        let address = SocketAddress::Abstract(name);

        let listener = address.bind_unix().unwrap();
        let (accepted, connected) = tokio::join!(listener.accept(), address.connect_unix());
        assert!(accepted.is_ok());
        assert!(connected.is_ok());
    }
}
