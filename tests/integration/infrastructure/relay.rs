use anyhow::{Context, Result};
use bytes::{Buf, BytesMut};
use futures::StreamExt;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, UdpSocket, UnixDatagram, UnixListener};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, warn};

use delivery_oracle::{Endpoint, TlsOptions};

/// Deliberate corruption applied by the relay to the lines it writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fault {
    #[default]
    None,
    /// Stop writing after this many lines
    TruncateAfter(usize),
    /// Hold back line `n + 1` and write it after line `n + 2`
    SwapAfter(usize),
}

/// Strips the priority and the structured version marker from a record
///
/// Returns `None` for records that carry no message, such as the empty
/// datagram sent when a datagram transport opens.
pub fn normalize(record: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(record);
    let text = text.trim_end_matches(['\0', '\n', '\r']);
    if text.is_empty() {
        return None;
    }
    let rest = text.strip_prefix('<')?;
    let rest = &rest[rest.find('>')? + 1..];
    Some(rest.strip_prefix("1 ").unwrap_or(rest).to_string())
}

/// Writes normalized lines into the sink file, applying the fault
struct SinkWriter {
    file: std::fs::File,
    fault: Fault,
    written: usize,
    held: Option<String>,
}

impl SinkWriter {
    fn create(path: &Path, fault: Fault) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to create sink {}", path.display()))?;
        Ok(Self {
            file,
            fault,
            written: 0,
            held: None,
        })
    }

    fn push(&mut self, record: &[u8]) -> io::Result<()> {
        let Some(line) = normalize(record) else {
            return Ok(());
        };
        match self.fault {
            Fault::TruncateAfter(limit) if self.written >= limit => return Ok(()),
            Fault::SwapAfter(n) if self.written == n && self.held.is_none() => {
                self.held = Some(line);
                return Ok(());
            }
            _ => {}
        }
        self.write_line(&line)?;
        if let Some(held) = self.held.take() {
            self.write_line(&held)?;
        }
        Ok(())
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.file, "{}", line)?;
        self.file.flush()?;
        self.written += 1;
        Ok(())
    }
}

/// Splits a byte stream into records, newline or octet-count delimited
#[derive(Debug, Default)]
pub struct RecordDecoder {
    octet_counting: bool,
}

impl RecordDecoder {
    pub fn new(octet_counting: bool) -> Self {
        Self { octet_counting }
    }
}

impl Decoder for RecordDecoder {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<BytesMut>> {
        if !self.octet_counting {
            return Ok(src
                .iter()
                .position(|b| *b == b'\n')
                .map(|end| src.split_to(end + 1)));
        }

        while matches!(src.first(), Some(b'\n') | Some(b'\r')) {
            src.advance(1);
        }
        let Some(space) = src.iter().position(|b| *b == b' ') else {
            return Ok(None);
        };
        let len: usize = std::str::from_utf8(&src[..space])
            .ok()
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid octet count"))?;
        if src.len() < space + 1 + len {
            return Ok(None);
        }
        src.advance(space + 1);
        Ok(Some(src.split_to(len)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<BytesMut>> {
        match self.decode(src)? {
            Some(record) => Ok(Some(record)),
            None if src.iter().all(|b| b.is_ascii_whitespace()) => {
                src.clear();
                Ok(None)
            }
            // Unterminated last record
            None if !self.octet_counting => Ok(Some(src.split())),
            None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated octet-counted record")),
        }
    }
}

async fn relay_stream<S>(stream: S, octet_counting: bool, writer: &mut SinkWriter) -> io::Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut records = FramedRead::new(stream, RecordDecoder::new(octet_counting));
    while let Some(record) = records.next().await {
        writer.push(&record?)?;
    }
    Ok(())
}

/// In-process stand-in for the subject's network side
///
/// Accepts messages on one endpoint and writes them, normalized the way a
/// daemon with a plain file destination would, into a sink file.
pub struct Relay {
    endpoint: Endpoint,
    sink: PathBuf,
    task: JoinHandle<()>,
}

impl Relay {
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    pub fn sink(&self) -> &Path {
        &self.sink
    }

    pub async fn tcp(sink: &Path, octet_counting: bool, fault: Fault) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let mut writer = SinkWriter::create(sink, fault)?;
        let task = tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                debug!("relay accepted {}", peer);
                if let Err(e) = relay_stream(stream, octet_counting, &mut writer).await {
                    warn!("relay connection from {} failed: {}", peer, e);
                }
            }
        });
        Ok(Self {
            endpoint: Endpoint::tcp(addr.to_string()),
            sink: sink.to_path_buf(),
            task,
        })
    }

    pub async fn tls(sink: &Path, acceptor: TlsAcceptor, client: TlsOptions, fault: Fault) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr: SocketAddr = listener.local_addr()?;
        let mut writer = SinkWriter::create(sink, fault)?;
        let task = tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                let stream = match acceptor.accept(stream).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("TLS handshake with {} failed: {}", peer, e);
                        continue;
                    }
                };
                if let Err(e) = relay_stream(stream, false, &mut writer).await {
                    warn!("relay connection from {} failed: {}", peer, e);
                }
            }
        });
        Ok(Self {
            endpoint: Endpoint::tls(addr.to_string(), client),
            sink: sink.to_path_buf(),
            task,
        })
    }

    pub async fn udp(sink: &Path, fault: Fault) -> Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let addr = socket.local_addr()?;
        let mut writer = SinkWriter::create(sink, fault)?;
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            while let Ok(len) = socket.recv(&mut buf).await {
                if let Err(e) = writer.push(&buf[..len]) {
                    warn!("relay write failed: {}", e);
                }
            }
        });
        Ok(Self {
            endpoint: Endpoint::udp(addr.to_string()),
            sink: sink.to_path_buf(),
            task,
        })
    }

    pub async fn unix_stream(socket_path: &Path, sink: &Path, octet_counting: bool, fault: Fault) -> Result<Self> {
        let listener = UnixListener::bind(socket_path)?;
        let mut writer = SinkWriter::create(sink, fault)?;
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if let Err(e) = relay_stream(stream, octet_counting, &mut writer).await {
                    warn!("relay unix connection failed: {}", e);
                }
            }
        });
        Ok(Self {
            endpoint: Endpoint::Unix {
                path: socket_path.to_path_buf(),
                dgram: false,
            },
            sink: sink.to_path_buf(),
            task,
        })
    }

    pub async fn unix_dgram(socket_path: &Path, sink: &Path, fault: Fault) -> Result<Self> {
        let socket = UnixDatagram::bind(socket_path)?;
        let mut writer = SinkWriter::create(sink, fault)?;
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            while let Ok(len) = socket.recv(&mut buf).await {
                if let Err(e) = writer.push(&buf[..len]) {
                    warn!("relay write failed: {}", e);
                }
            }
        });
        Ok(Self {
            endpoint: Endpoint::Unix {
                path: socket_path.to_path_buf(),
                dgram: true,
            },
            sink: sink.to_path_buf(),
            task,
        })
    }

    /// Creates a FIFO and relays its fixed-width records once a writer appears
    pub async fn fifo(fifo_path: &Path, sink: &Path, record_width: usize, fault: Fault) -> Result<Self> {
        nix::unistd::mkfifo(fifo_path, nix::sys::stat::Mode::from_bits_truncate(0o600))
            .with_context(|| format!("Failed to create FIFO {}", fifo_path.display()))?;
        let mut writer = SinkWriter::create(sink, fault)?;
        let path = fifo_path.to_path_buf();
        let task = tokio::spawn(async move {
            // Opening the reading end waits for the writer
            let mut file = match tokio::fs::File::open(&path).await {
                Ok(file) => file,
                Err(e) => {
                    warn!("relay could not open {}: {}", path.display(), e);
                    return;
                }
            };
            let mut record = vec![0u8; record_width];
            while file.read_exact(&mut record).await.is_ok() {
                if let Err(e) = writer.push(&record) {
                    warn!("relay write failed: {}", e);
                }
            }
        });
        Ok(Self {
            endpoint: Endpoint::File {
                path: fifo_path.to_path_buf(),
                record_width: Some(record_width),
            },
            sink: sink.to_path_buf(),
            task,
        })
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// TLS fixtures: a test CA and a `localhost` server certificate signed by it
pub struct TlsFixture {
    pub acceptor: TlsAcceptor,
    pub ca_file: PathBuf,
}

impl TlsFixture {
    pub fn generate(dir: &Path) -> Result<Self> {
        use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, SanType};
        use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

        let mut ca_params = CertificateParams::default();
        ca_params.distinguished_name.push(DnType::CommonName, "Oracle Test CA");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_key = KeyPair::generate()?;
        let ca_cert = ca_params.self_signed(&ca_key)?;

        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, "localhost");
        params.subject_alt_names = vec![SanType::DnsName("localhost".try_into()?)];
        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &ca_cert, &ca_key)?;

        let ca_file = dir.join("ca.pem");
        std::fs::write(&ca_file, ca_cert.pem())?;

        let chain: Vec<CertificateDer<'static>> = vec![cert.der().clone()];
        let private_key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
        let config = rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(chain, private_key)?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            ca_file,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_priority_and_version() {
        assert_eq!(normalize(b"<7>2004 host a 000/00001\n").as_deref(), Some("2004 host a 000/00001"));
        assert_eq!(normalize(b"<13>1 2004 host\n").as_deref(), Some("2004 host"));
        assert_eq!(normalize(b"<7>x\0\0\0").as_deref(), Some("x"));
        assert_eq!(normalize(b""), None);
    }

    #[test]
    fn test_octet_counted_records() {
        let mut decoder = RecordDecoder::new(true);
        let mut buf = BytesMut::from(&b"5 hello\n3 abc\n2 x"[..]);
        assert_eq!(&decoder.decode(&mut buf).unwrap().unwrap()[..], b"hello");
        assert_eq!(&decoder.decode(&mut buf).unwrap().unwrap()[..], b"abc");
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }
}
