use super::Result;
use eyre::{eyre, WrapErr};
use futures::future::BoxFuture;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::fs::FileTypeExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpStream, UdpSocket, UnixDatagram, UnixStream};
use tokio::time::{sleep, timeout};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

/// Upper bound on a single send before the subject is considered stuck
pub const SEND_TIMEOUT: Duration = Duration::from_secs(3);

/// Backoff applied when the kernel reports exhausted send buffers
pub const BUFFER_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// TLS client settings for encrypted stream transports
#[derive(Debug, Clone)]
pub struct TlsOptions {
    /// Name presented via SNI and checked against the certificate
    pub server_name: String,
    /// PEM bundle to verify the subject's certificate; `None` accepts any certificate
    pub ca_file: Option<PathBuf>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            server_name: "localhost".to_string(),
            ca_file: None,
        }
    }
}

/// Where generated messages are delivered
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// IP socket; `addr` is `host:port`
    Inet {
        addr: String,
        dgram: bool,
        tls: Option<TlsOptions>,
    },
    /// Unix domain socket
    Unix { path: PathBuf, dgram: bool },
    /// Regular file (appended) or FIFO; FIFO records may be NUL padded to a fixed width
    File {
        path: PathBuf,
        record_width: Option<usize>,
    },
}

impl Endpoint {
    pub fn tcp(addr: impl Into<String>) -> Self {
        Endpoint::Inet {
            addr: addr.into(),
            dgram: false,
            tls: None,
        }
    }

    pub fn udp(addr: impl Into<String>) -> Self {
        Endpoint::Inet {
            addr: addr.into(),
            dgram: true,
            tls: None,
        }
    }

    pub fn tls(addr: impl Into<String>, tls: TlsOptions) -> Self {
        Endpoint::Inet {
            addr: addr.into(),
            dgram: false,
            tls: Some(tls),
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Endpoint::File {
            path: path.into(),
            record_width: None,
        }
    }

    /// Datagram endpoints get paced sends and no stream framing
    pub fn is_datagram(&self) -> bool {
        matches!(
            self,
            Endpoint::Inet { dgram: true, .. } | Endpoint::Unix { dgram: true, .. }
        )
    }

    pub fn is_stream_socket(&self) -> bool {
        matches!(
            self,
            Endpoint::Inet { dgram: false, .. } | Endpoint::Unix { dgram: false, .. }
        )
    }

    /// Fixed record size for FIFO sinks that read fixed frames
    pub fn record_width(&self) -> Option<usize> {
        match self {
            Endpoint::File { record_width, .. } => *record_width,
            _ => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Inet { addr, dgram: true, .. } => write!(f, "udp({})", addr),
            Endpoint::Inet { addr, tls: Some(_), .. } => write!(f, "tls({})", addr),
            Endpoint::Inet { addr, .. } => write!(f, "tcp({})", addr),
            Endpoint::Unix { path, dgram: true } => write!(f, "unix-dgram({})", path.display()),
            Endpoint::Unix { path, dgram: false } => write!(f, "unix-stream({})", path.display()),
            Endpoint::File { path, .. } => write!(f, "file({})", path.display()),
        }
    }
}

/// An open channel to the subject
enum Connection {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    Unix(UnixStream),
    Udp(UdpSocket),
    UnixDgram(UnixDatagram),
    File(File),
}

/// Delivers encoded records to an endpoint
///
/// The connection is opened lazily and kept across streams until `close`.
/// The label starts as the endpoint's name and becomes `pipe(..)` once a
/// file endpoint is found to be a FIFO.
pub struct Transport {
    endpoint: Endpoint,
    label: String,
    send_by_bytes: bool,
    connection: Option<Connection>,
}

impl Transport {
    /// Creates an unopened transport
    ///
    /// # Arguments
    /// * `endpoint` - Target of the sends
    /// * `send_by_bytes` - Write every record one byte at a time
    pub fn new(endpoint: Endpoint, send_by_bytes: bool) -> Self {
        Self {
            label: endpoint.to_string(),
            endpoint,
            send_by_bytes,
            connection: None,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Name of the transport as embedded in generated messages
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_some()
    }

    /// Opens the connection unless it is already open
    pub async fn open(&mut self) -> Result<()> {
        if self.connection.is_some() {
            return Ok(());
        }

        let connection = match &self.endpoint {
            Endpoint::Inet { addr, dgram: false, tls: None } => {
                let stream = TcpStream::connect(addr.as_str())
                    .await
                    .wrap_err_with(|| format!("failed to connect to tcp({})", addr))?;
                Connection::Tcp(stream)
            }
            Endpoint::Inet { addr, dgram: false, tls: Some(options) } => {
                let stream = TcpStream::connect(addr.as_str())
                    .await
                    .wrap_err_with(|| format!("failed to connect to tls({})", addr))?;
                let server_name = ServerName::try_from(options.server_name.as_str())
                    .wrap_err_with(|| format!("invalid TLS server name '{}'", options.server_name))?
                    .to_owned();
                let tls = tls_connector(options)?
                    .connect(server_name, stream)
                    .await
                    .wrap_err_with(|| format!("TLS handshake with {} failed", addr))?;
                Connection::Tls(Box::new(tls))
            }
            Endpoint::Inet { addr, dgram: true, .. } => {
                let target = lookup_host(addr.as_str())
                    .await
                    .wrap_err_with(|| format!("failed to resolve {}", addr))?
                    .next()
                    .ok_or_else(|| eyre!("{} did not resolve to any address", addr))?;
                let local: SocketAddr = if target.is_ipv4() {
                    (Ipv4Addr::UNSPECIFIED, 0).into()
                } else {
                    (Ipv6Addr::UNSPECIFIED, 0).into()
                };
                let socket = UdpSocket::bind(local).await?;
                socket.connect(target).await?;
                // An empty datagram primes the receiving side
                socket.send(&[]).await?;
                Connection::Udp(socket)
            }
            Endpoint::Unix { path, dgram: false } => {
                let stream = UnixStream::connect(path)
                    .await
                    .wrap_err_with(|| format!("failed to connect to {}", path.display()))?;
                Connection::Unix(stream)
            }
            Endpoint::Unix { path, dgram: true } => {
                let socket = UnixDatagram::unbound()?;
                socket
                    .connect(path)
                    .wrap_err_with(|| format!("failed to connect to {}", path.display()))?;
                socket.send(&[]).await?;
                Connection::UnixDgram(socket)
            }
            Endpoint::File { path, record_width } => {
                let fifo = tokio::fs::metadata(path)
                    .await
                    .map(|meta| meta.file_type().is_fifo())
                    .unwrap_or(false);
                let mut options = OpenOptions::new();
                if fifo {
                    self.label = match record_width {
                        Some(width) => format!("pipe({}[{}])", path.display(), width),
                        None => format!("pipe({})", path.display()),
                    };
                    // Blocks until the subject opens the reading end
                    options.write(true);
                } else {
                    options.append(true).create(true);
                }
                let file = options
                    .open(path)
                    .await
                    .wrap_err_with(|| format!("failed to open {}", path.display()))?;
                Connection::File(file)
            }
        };

        info!("opened transport {}", self.label);
        self.connection = Some(connection);
        Ok(())
    }

    /// Sends one encoded record
    ///
    /// Exhausted send buffers are retried after a backoff; every other error
    /// is logged and returned.
    pub async fn send(&mut self, record: &[u8]) -> Result<()> {
        if self.send_by_bytes {
            for byte in record {
                self.send_chunk(std::slice::from_ref(byte)).await?;
            }
            Ok(())
        } else {
            self.send_chunk(record).await
        }
    }

    async fn send_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        retry_on_exhaustion(&self.label, &mut self.connection, chunk, write_boxed).await
    }

    /// Flushes and closes the connection; a closed transport is left alone
    pub async fn close(&mut self) -> Result<()> {
        let Some(connection) = self.connection.take() else {
            return Ok(());
        };

        match connection {
            Connection::Tcp(mut stream) => stream.shutdown().await?,
            Connection::Tls(mut stream) => stream.shutdown().await?,
            Connection::Unix(mut stream) => stream.shutdown().await?,
            Connection::File(mut file) => file.flush().await?,
            Connection::Udp(_) | Connection::UnixDgram(_) => {}
        }
        debug!("closed transport {}", self.label);
        Ok(())
    }
}

/// Repeats `attempt` while the kernel reports exhausted send buffers
///
/// Each attempt is bounded by [`SEND_TIMEOUT`]. Any other error, or a
/// timeout, is logged and ends the send.
async fn retry_on_exhaustion<T, F>(label: &str, target: &mut T, chunk: &[u8], mut attempt: F) -> Result<()>
where
    F: for<'a> FnMut(&'a mut T, &'a [u8]) -> BoxFuture<'a, io::Result<()>>,
{
    loop {
        match timeout(SEND_TIMEOUT, attempt(&mut *target, chunk)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) if is_buffer_exhaustion(&e) => {
                warn!("send buffer exhausted on {} ({}), sleeping", label, e);
                sleep(BUFFER_RETRY_BACKOFF).await;
            }
            Ok(Err(e)) => {
                error!("send to {} failed, the subject may not be accepting messages: {}", label, e);
                return Err(e).wrap_err_with(|| format!("send to {} failed", label));
            }
            Err(_) => {
                error!("send to {} timed out after {:?}", label, SEND_TIMEOUT);
                return Err(eyre!("send to {} timed out", label));
            }
        }
    }
}

fn write_boxed<'a>(connection: &'a mut Option<Connection>, chunk: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
    Box::pin(write_once(connection, chunk))
}

async fn write_once(connection: &mut Option<Connection>, chunk: &[u8]) -> io::Result<()> {
    let connection = connection
        .as_mut()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport is not open"))?;

    match connection {
        Connection::Tcp(stream) => stream.write_all(chunk).await,
        Connection::Tls(stream) => {
            stream.write_all(chunk).await?;
            stream.flush().await
        }
        Connection::Unix(stream) => stream.write_all(chunk).await,
        Connection::Udp(socket) => socket.send(chunk).await.map(|_| ()),
        Connection::UnixDgram(socket) => socket.send(chunk).await.map(|_| ()),
        Connection::File(file) => {
            file.write_all(chunk).await?;
            file.flush().await
        }
    }
}

fn is_buffer_exhaustion(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::ENOBUFS)
}

fn tls_connector(options: &TlsOptions) -> Result<TlsConnector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .wrap_err("no usable TLS protocol versions")?;

    let config = match &options.ca_file {
        Some(path) => {
            let pem = std::fs::read(path)
                .wrap_err_with(|| format!("failed to read CA bundle {}", path.display()))?;
            let mut roots = RootCertStore::empty();
            for cert in CertificateDer::pem_slice_iter(&pem) {
                let cert = cert.wrap_err_with(|| format!("invalid certificate in {}", path.display()))?;
                roots.add(cert).wrap_err("failed to add CA certificate")?;
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        None => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth(),
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Accepts whatever certificate the subject presents; signatures are still checked
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
