//! Raw TCP connection to one node
//!
//! Blocking TCP (and optionally TLS) connection speaking RESP, plus the
//! `ConnectionFactory` that dials, authenticates and selects a database.

use std::io::{self, BufReader, BufWriter, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use super::control_plane::{ControlPlane, ControlPlaneExt};
use crate::cluster::Endpoint;
use crate::config::{ConnectionDescriptor, TlsConfig};
use crate::utils::{CacheError, ConnectionError, RespDecoder, RespEncoder, RespValue, Result};

/// Boxed node connection as handed out by a `Connector`
pub type NodeConnection = Box<dyn ControlPlane + Send>;

/// Dials node connections
///
/// The connection manager only ever creates connections through this
/// trait, so tests can substitute scripted nodes.
pub trait Connector: Send + Sync {
    fn connect(&self, endpoint: &Endpoint) -> Result<NodeConnection>;
}

enum Transport {
    Tcp {
        writer: BufWriter<TcpStream>,
        reader: BufReader<TcpStream>,
    },
    #[cfg(feature = "native-tls-backend")]
    NativeTls {
        stream: BufReader<native_tls::TlsStream<TcpStream>>,
    },
}

/// Raw connection wrapper (TCP or TLS)
pub struct RawConnection {
    endpoint: Endpoint,
    transport: Transport,
    encoder: RespEncoder,
}

impl RawConnection {
    /// Open a plain TCP connection
    pub fn connect_tcp(endpoint: &Endpoint, connect_timeout: Duration) -> Result<Self> {
        let stream = dial(endpoint, connect_timeout)?;

        let writer = BufWriter::with_capacity(
            16 * 1024,
            stream.try_clone().map_err(|e| connect_failed(endpoint, e))?,
        );
        let reader = BufReader::with_capacity(16 * 1024, stream);

        Ok(Self {
            endpoint: endpoint.clone(),
            transport: Transport::Tcp { writer, reader },
            encoder: RespEncoder::with_capacity(256),
        })
    }

    /// Open a TLS connection
    #[cfg(feature = "native-tls-backend")]
    pub fn connect_tls(
        endpoint: &Endpoint,
        connect_timeout: Duration,
        tls_config: &TlsConfig,
    ) -> Result<Self> {
        use native_tls::{Certificate, TlsConnector};

        let mut builder = TlsConnector::builder();
        if tls_config.skip_verify {
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
        }
        if let Some(ref ca_path) = tls_config.ca_cert {
            let ca_data = std::fs::read(ca_path).map_err(|e| {
                ConnectionError::TlsFailed(format!("Failed to read CA cert: {}", e))
            })?;
            let cert = Certificate::from_pem(&ca_data)
                .map_err(|e| ConnectionError::TlsFailed(format!("Invalid CA cert: {}", e)))?;
            builder.add_root_certificate(cert);
        }
        let connector = builder.build().map_err(|e| {
            ConnectionError::TlsFailed(format!("Failed to build TLS connector: {}", e))
        })?;

        let tcp_stream = dial(endpoint, connect_timeout)?;
        let sni_host = tls_config.sni.as_deref().unwrap_or(&endpoint.host);
        let tls_stream = connector
            .connect(sni_host, tcp_stream)
            .map_err(|e| ConnectionError::TlsFailed(format!("{}: {}", endpoint, e)))?;

        Ok(Self {
            endpoint: endpoint.clone(),
            transport: Transport::NativeTls {
                stream: BufReader::with_capacity(16 * 1024, tls_stream),
            },
            encoder: RespEncoder::with_capacity(256),
        })
    }

    /// Set read and write timeouts on the underlying socket
    pub fn set_timeouts(&mut self, read: Duration, write: Duration) -> io::Result<()> {
        let socket = match &self.transport {
            Transport::Tcp { reader, .. } => reader.get_ref(),
            #[cfg(feature = "native-tls-backend")]
            Transport::NativeTls { stream } => stream.get_ref().get_ref(),
        };
        socket.set_read_timeout(Some(read))?;
        socket.set_write_timeout(Some(write))
    }

    fn round_trip(&mut self, args: &[&[u8]]) -> io::Result<RespValue> {
        self.encoder.clear();
        self.encoder.encode_command(args);

        match &mut self.transport {
            Transport::Tcp { writer, reader } => {
                writer.write_all(self.encoder.as_bytes())?;
                writer.flush()?;
                RespDecoder::new(reader).decode()
            }
            #[cfg(feature = "native-tls-backend")]
            Transport::NativeTls { stream } => {
                let tls = stream.get_mut();
                tls.write_all(self.encoder.as_bytes())?;
                tls.flush()?;
                RespDecoder::new(stream).decode()
            }
        }
    }
}

impl ControlPlane for RawConnection {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn execute_binary(&mut self, args: &[&[u8]]) -> Result<RespValue> {
        self.round_trip(args).map_err(|source| {
            ConnectionError::Io {
                endpoint: self.endpoint.clone(),
                source,
            }
            .into()
        })
    }
}

fn connect_failed(endpoint: &Endpoint, source: io::Error) -> CacheError {
    ConnectionError::ConnectFailed {
        endpoint: endpoint.clone(),
        source,
    }
    .into()
}

/// Resolve and connect, trying every resolved address in turn
fn dial(endpoint: &Endpoint, connect_timeout: Duration) -> Result<TcpStream> {
    let addrs = (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()
        .map_err(|e| connect_failed(endpoint, e))?;

    let mut last_err = io::Error::new(io::ErrorKind::NotFound, "No addresses found");
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, connect_timeout) {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                return Ok(stream);
            }
            Err(e) => {
                debug!("Connect to {} ({}) failed: {}", endpoint, addr, e);
                last_err = e;
            }
        }
    }
    Err(connect_failed(endpoint, last_err))
}

/// Connection factory for creating node connections with common settings
#[derive(Debug, Clone)]
pub struct ConnectionFactory {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub tls_config: Option<TlsConfig>,
    pub auth_password: Option<String>,
    pub auth_username: Option<String>,
    pub dbnum: Option<u32>,
}

impl ConnectionFactory {
    pub fn from_descriptor(descriptor: &ConnectionDescriptor) -> Self {
        Self {
            connect_timeout: descriptor.connect_timeout,
            read_timeout: descriptor.operation_timeout,
            write_timeout: descriptor.operation_timeout,
            tls_config: descriptor.tls.clone(),
            auth_password: descriptor.password.clone(),
            auth_username: descriptor.username.clone(),
            dbnum: descriptor.dbnum,
        }
    }

    /// Create a new connection to the specified node
    pub fn create(&self, endpoint: &Endpoint) -> Result<RawConnection> {
        let mut conn = match &self.tls_config {
            #[cfg(feature = "native-tls-backend")]
            Some(tls) => RawConnection::connect_tls(endpoint, self.connect_timeout, tls)?,
            #[cfg(not(feature = "native-tls-backend"))]
            Some(_) => {
                return Err(ConnectionError::TlsFailed(
                    "TLS support not compiled in (enable feature native-tls-backend)".to_string(),
                )
                .into());
            }
            None => RawConnection::connect_tcp(endpoint, self.connect_timeout)?,
        };

        conn.set_timeouts(self.read_timeout, self.write_timeout)
            .map_err(|e| connect_failed(endpoint, e))?;

        if let Some(ref password) = self.auth_password {
            conn.authenticate(password, self.auth_username.as_deref())?;
        }
        if let Some(db) = self.dbnum {
            conn.select_db(db)?;
        }

        debug!("Connected to {}", endpoint);
        Ok(conn)
    }
}

impl Connector for ConnectionFactory {
    fn connect(&self, endpoint: &Endpoint) -> Result<NodeConnection> {
        Ok(Box::new(self.create(endpoint)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, Read};
    use std::net::TcpListener;
    use std::thread;

    fn factory() -> ConnectionFactory {
        ConnectionFactory {
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(2),
            tls_config: None,
            auth_password: None,
            auth_username: None,
            dbnum: None,
        }
    }

    #[test]
    fn test_round_trip_against_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            // *1\r\n$4\r\nPING\r\n is three lines
            let mut line = String::new();
            for _ in 0..3 {
                line.clear();
                reader.read_line(&mut line).unwrap();
            }
            writer.write_all(b"+PONG\r\n").unwrap();
            // Drain until the client hangs up
            let mut rest = Vec::new();
            let _ = reader.read_to_end(&mut rest);
        });

        let mut conn = factory().create(&Endpoint::new("127.0.0.1", port)).unwrap();
        conn.ping().unwrap();
        drop(conn);
        server.join().unwrap();
    }

    #[test]
    fn test_refused_connection_is_connect_failed() {
        // Bind then drop to get a port nobody listens on
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let err = factory().create(&Endpoint::new("127.0.0.1", port)).err().unwrap();
        assert!(matches!(
            err,
            CacheError::Connection(ConnectionError::ConnectFailed { .. })
        ));
    }

    #[cfg(feature = "native-tls-backend")]
    #[test]
    fn test_tls_dials_before_handshake() {
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let mut f = factory();
        f.tls_config = Some(TlsConfig::default());
        let err = f.create(&Endpoint::new("127.0.0.1", port)).err().unwrap();
        // Refused at TCP level, so retryable rather than a TLS setup failure
        assert!(matches!(
            err,
            CacheError::Connection(ConnectionError::ConnectFailed { .. })
        ));
    }

    #[cfg(not(feature = "native-tls-backend"))]
    #[test]
    fn test_tls_without_backend() {
        let mut f = factory();
        f.tls_config = Some(TlsConfig::default());
        let err = f.create(&Endpoint::new("127.0.0.1", 1)).err().unwrap();
        assert!(matches!(err, CacheError::Connection(ConnectionError::TlsFailed(_))));
    }
}
