// Backend transport: SOAP envelopes over .NET Message Framing (net.tcp) with a TLS upgrade

use crate::config::EndpointConfig;
use crate::error::GatewayError;
use crate::soap;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::net::TcpStream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::TlsConnector;
use rustls::client::ClientConfig;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::SignatureScheme;
use rustls_pki_types::ServerName;

/// Open, send, receive and close all share this bound.
pub const CHANNEL_TIMEOUT: Duration = Duration::from_secs(600);

/// Largest envelope accepted from the backend.
const MAX_ENVELOPE_SIZE: usize = 256 * 1024 * 1024;

// [MC-NMF] record types
const RECORD_VERSION: u8 = 0x00;
const RECORD_MODE: u8 = 0x01;
const RECORD_VIA: u8 = 0x02;
const RECORD_KNOWN_ENCODING: u8 = 0x03;
const RECORD_SIZED_ENVELOPE: u8 = 0x06;
const RECORD_END: u8 = 0x07;
const RECORD_FAULT: u8 = 0x08;
const RECORD_UPGRADE_REQUEST: u8 = 0x09;
const RECORD_UPGRADE_RESPONSE: u8 = 0x0A;
const RECORD_PREAMBLE_ACK: u8 = 0x0B;
const RECORD_PREAMBLE_END: u8 = 0x0C;

const MODE_DUPLEX: u8 = 0x02;
/// Known encoding announced in the preamble: SOAP 1.2 UTF-8 text.
///
/// Stock ADWS net.tcp endpoints negotiate the binary XML encoding (0x08), which this
/// channel does not speak. Against such an endpoint the preamble is answered with a
/// content-type fault record and the connect fails with a transport error naming it.
const ENCODING_SOAP12_UTF8: u8 = 0x03;
const UPGRADE_SSL: &str = "application/ssl-tls";

/// ADWS endpoints used by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdwsService {
    /// WS-Transfer (Get)
    Resource,
    /// WS-Enumeration (Enumerate, Pull, Renew, Release)
    Enumeration,
}

impl AdwsService {
    pub fn name(&self) -> &'static str {
        match self {
            AdwsService::Resource => "Resource",
            AdwsService::Enumeration => "Enumeration",
        }
    }

    pub fn uri(&self, endpoint: &EndpointConfig) -> String {
        let auth = if endpoint.use_windows_auth { "Windows" } else { "UserName" };
        format!(
            "net.tcp://{}:{}/ActiveDirectoryWebServices/{}/{}",
            endpoint.server,
            endpoint.port,
            auth,
            self.name()
        )
    }
}

/// An authenticated request/response channel to one ADWS endpoint.
#[async_trait]
pub trait SoapChannel: Send + Sync {
    /// Address used for the wsa:To header.
    fn endpoint_uri(&self) -> &str;

    /// Send one envelope and wait for the reply envelope.
    async fn request(&self, action: &str, envelope: String) -> Result<String>;

    /// True once the channel can no longer carry requests.
    fn is_closed(&self) -> bool;

    async fn close(&self) {}
}

/// Builds channels for an endpoint. The handle cache calls this whenever a channel is missing or closed.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, service: AdwsService) -> Result<Arc<dyn SoapChannel>>;
}

/// Connector speaking net.tcp framing with a TLS upgrade (UserName security mode).
pub struct NmfConnector {
    endpoint: EndpointConfig,
    tls_config: Arc<ClientConfig>,
}

impl std::fmt::Debug for NmfConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NmfConnector")
            .field("server", &self.endpoint.server)
            .field("port", &self.endpoint.port)
            .finish()
    }
}

impl NmfConnector {
    pub fn new(endpoint: EndpointConfig) -> Result<Self> {
        let tls_config = match endpoint.tls_ca_file.as_deref() {
            Some(path) => {
                let pem = std::fs::read(path)
                    .with_context(|| format!("Failed to read backend CA file {}", path))?;
                default_tls_client_config_with_ca(Some(&pem))?
            }
            None => tls_client_config_insecure(),
        };
        Ok(Self { endpoint, tls_config })
    }

    async fn open_stream(&self, uri: &str) -> Result<ClientTlsStream<TcpStream>> {
        let addr = format!("{}:{}", self.endpoint.server, self.endpoint.port);
        let mut tcp = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("Failed to connect to ADWS {}", addr))?;
        negotiate_upgrade(&mut tcp, uri).await?;

        let connector = TlsConnector::from(Arc::clone(&self.tls_config));
        let server_name = ServerName::try_from(self.endpoint.server.clone())
            .map_err(|_| anyhow::anyhow!("Invalid hostname for TLS SNI: {}", addr))?;
        let mut tls = connector
            .connect(server_name, tcp)
            .await
            .with_context(|| format!("TLS handshake to ADWS {} failed", addr))?;
        finish_preamble(&mut tls).await?;
        Ok(tls)
    }
}

#[async_trait]
impl ChannelConnector for NmfConnector {
    async fn connect(&self, service: AdwsService) -> Result<Arc<dyn SoapChannel>> {
        if self.endpoint.use_windows_auth {
            return Err(GatewayError::Transport(
                "Windows integrated authentication is not supported by this transport; use username/password/domain".to_string(),
            )
            .into());
        }
        let uri = service.uri(&self.endpoint);
        debug!("Opening ADWS channel to {}", uri);
        let stream = match timeout(CHANNEL_TIMEOUT, self.open_stream(&uri)).await {
            Ok(result) => result?,
            Err(_) => return Err(GatewayError::Transport(format!("Timed out opening {}", uri)).into()),
        };
        info!("ADWS channel open: {}", uri);
        let security = self
            .endpoint
            .credential
            .as_ref()
            .map(|c| soap::security_header(&format!("{}@{}", c.username, c.domain), &c.password));
        Ok(Arc::new(NmfChannel::new(uri, stream, security)))
    }
}

/// One framed duplex session. Requests are serialized over the single stream.
pub struct NmfChannel<S> {
    uri: String,
    stream: Mutex<S>,
    closed: AtomicBool,
    security_header: Option<String>,
}

impl<S> NmfChannel<S> {
    pub fn new(uri: String, stream: S, security_header: Option<String>) -> Self {
        Self {
            uri,
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
            security_header,
        }
    }
}

#[async_trait]
impl<S> SoapChannel for NmfChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn endpoint_uri(&self) -> &str {
        &self.uri
    }

    async fn request(&self, action: &str, envelope: String) -> Result<String> {
        if self.is_closed() {
            return Err(GatewayError::Transport(format!("Channel to {} is closed", self.uri)).into());
        }
        debug!("ADWS request {} to {}: {}", action, self.uri, envelope);
        let envelope = match &self.security_header {
            Some(header) => soap::with_header(&envelope, header),
            None => envelope,
        };

        let mut stream = self.stream.lock().await;
        let exchange = async {
            send_envelope(&mut *stream, &envelope).await?;
            receive_envelope(&mut *stream).await
        };
        match timeout(CHANNEL_TIMEOUT, exchange).await {
            Ok(Ok(response)) => {
                debug!("ADWS response to {}: {}", action, response);
                Ok(response)
            }
            Ok(Err(e)) => {
                self.closed.store(true, Ordering::Relaxed);
                Err(e)
            }
            Err(_) => {
                self.closed.store(true, Ordering::Relaxed);
                Err(GatewayError::Transport(format!("Timed out waiting for {} response from {}", action, self.uri)).into())
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        let mut stream = self.stream.lock().await;
        let shutdown = async {
            stream.write_all(&[RECORD_END]).await?;
            stream.flush().await?;
            stream.shutdown().await
        };
        match timeout(CHANNEL_TIMEOUT, shutdown).await {
            Ok(Ok(())) => debug!("ADWS channel closed: {}", self.uri),
            Ok(Err(e)) => warn!("Error closing ADWS channel {}: {}", self.uri, e),
            Err(_) => warn!("Timed out closing ADWS channel {}", self.uri),
        }
    }
}

/// 7-bit little-endian varint used for NMF sizes.
pub(crate) fn encode_multibyte_int(mut value: usize, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub(crate) async fn read_multibyte_int<R: AsyncRead + Unpin>(reader: &mut R) -> Result<usize> {
    let mut value = 0usize;
    for i in 0..5 {
        let byte = reader.read_u8().await.context("Read NMF size")?;
        value |= ((byte & 0x7F) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    bail!("NMF size is longer than 5 bytes")
}

fn push_sized(out: &mut Vec<u8>, data: &[u8]) {
    encode_multibyte_int(data.len(), out);
    out.extend_from_slice(data);
}

async fn read_sized<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let size = read_multibyte_int(reader).await?;
    if size > MAX_ENVELOPE_SIZE {
        bail!("NMF record of {} bytes exceeds limit", size);
    }
    let mut data = vec![0u8; size];
    reader.read_exact(&mut data).await.context("Read NMF record body")?;
    Ok(data)
}

/// Version, mode, via and encoding records that open every session.
pub(crate) fn preamble(via: &str) -> Vec<u8> {
    let mut out = vec![RECORD_VERSION, 0x01, 0x00, RECORD_MODE, MODE_DUPLEX, RECORD_VIA];
    push_sized(&mut out, via.as_bytes());
    out.extend_from_slice(&[RECORD_KNOWN_ENCODING, ENCODING_SOAP12_UTF8]);
    out
}

/// Read one record type byte and require `expected`. A fault record becomes a transport error.
async fn expect_record<R: AsyncRead + Unpin>(reader: &mut R, expected: u8) -> Result<()> {
    let record = reader.read_u8().await.context("Read NMF record")?;
    if record == expected {
        return Ok(());
    }
    if record == RECORD_FAULT {
        let fault = read_sized(reader).await?;
        return Err(GatewayError::Transport(format!("Framing fault: {}", String::from_utf8_lossy(&fault))).into());
    }
    Err(GatewayError::Transport(format!("Unexpected NMF record 0x{:02X}, expected 0x{:02X}", record, expected)).into())
}

/// Send the preamble and request the TLS upgrade. Runs over the plain TCP stream.
pub(crate) async fn negotiate_upgrade<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S, via: &str) -> Result<()> {
    let mut out = preamble(via);
    out.push(RECORD_UPGRADE_REQUEST);
    push_sized(&mut out, UPGRADE_SSL.as_bytes());
    stream.write_all(&out).await.context("Write NMF preamble")?;
    stream.flush().await?;
    expect_record(stream, RECORD_UPGRADE_RESPONSE).await
}

/// Close the preamble inside the upgraded stream.
pub(crate) async fn finish_preamble<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<()> {
    stream.write_all(&[RECORD_PREAMBLE_END]).await.context("Write NMF preamble end")?;
    stream.flush().await?;
    expect_record(stream, RECORD_PREAMBLE_ACK).await
}

pub(crate) async fn send_envelope<W: AsyncWrite + Unpin>(writer: &mut W, envelope: &str) -> Result<()> {
    let mut out = Vec::with_capacity(envelope.len() + 6);
    out.push(RECORD_SIZED_ENVELOPE);
    push_sized(&mut out, envelope.as_bytes());
    writer.write_all(&out).await.context("Write NMF envelope")?;
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn receive_envelope<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    match reader.read_u8().await.context("Read NMF record")? {
        RECORD_SIZED_ENVELOPE => {
            let payload = read_sized(reader).await?;
            String::from_utf8(payload)
                .map_err(|_| anyhow::Error::from(GatewayError::MalformedResponse("Envelope is not UTF-8".to_string())))
        }
        RECORD_END => Err(GatewayError::Transport("Backend ended the session".to_string()).into()),
        RECORD_FAULT => {
            let fault = read_sized(reader).await?;
            Err(GatewayError::Transport(format!("Framing fault: {}", String::from_utf8_lossy(&fault))).into())
        }
        other => Err(GatewayError::Transport(format!("Unexpected NMF record 0x{:02X}", other)).into()),
    }
}

/// Verifier that accepts any server certificate. ADWS endpoints usually present a DC certificate that
/// is not in any public root store.
#[derive(Debug)]
struct InsecureServerVerifier;

impl ServerCertVerifier for InsecureServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls_pki_types::CertificateDer<'_>,
        _intermediates: &[rustls_pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

/// TLS client config that skips server certificate verification.
fn tls_client_config_insecure() -> Arc<ClientConfig> {
    let mut config = ClientConfig::builder()
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();
    config.dangerous().set_certificate_verifier(Arc::new(InsecureServerVerifier));
    Arc::new(config)
}

/// TLS client config with system roots plus an optional extra CA bundle.
fn default_tls_client_config_with_ca(extra_ca_pem: Option<&[u8]>) -> Result<Arc<ClientConfig>> {
    let mut root_store = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().context("Load system CA certs")? {
        let _ = root_store.add(cert);
    }
    if let Some(pem) = extra_ca_pem {
        for cert in rustls_pemfile::certs(&mut std::io::Cursor::new(pem)) {
            let cert = cert.map_err(|e| anyhow::anyhow!("Parse CA PEM: {}", e))?;
            let _ = root_store.add(cert);
        }
    }
    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn endpoint(use_windows_auth: bool) -> EndpointConfig {
        EndpointConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            server: "dc01.corp.local".to_string(),
            port: 9389,
            instance: "ldap:389".to_string(),
            use_windows_auth,
            credential: None,
            tls_ca_file: None,
        }
    }

    #[test]
    fn test_service_uri() {
        assert_eq!(
            AdwsService::Enumeration.uri(&endpoint(false)),
            "net.tcp://dc01.corp.local:9389/ActiveDirectoryWebServices/UserName/Enumeration"
        );
        assert_eq!(
            AdwsService::Resource.uri(&endpoint(true)),
            "net.tcp://dc01.corp.local:9389/ActiveDirectoryWebServices/Windows/Resource"
        );
    }

    #[test]
    fn test_encode_multibyte_int() {
        let cases: [(usize, &[u8]); 5] = [
            (0, &[0x00]),
            (127, &[0x7F]),
            (128, &[0x80, 0x01]),
            (300, &[0xAC, 0x02]),
            (16384, &[0x80, 0x80, 0x01]),
        ];
        for (value, expected) in cases {
            let mut out = Vec::new();
            encode_multibyte_int(value, &mut out);
            assert_eq!(out, expected, "value {}", value);
        }
    }

    #[tokio::test]
    async fn test_read_multibyte_int() {
        let mut data: &[u8] = &[0xAC, 0x02, 0x7F];
        assert_eq!(read_multibyte_int(&mut data).await.unwrap(), 300);
        assert_eq!(read_multibyte_int(&mut data).await.unwrap(), 127);
        let mut too_long: &[u8] = &[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01];
        assert!(read_multibyte_int(&mut too_long).await.is_err());
    }

    #[test]
    fn test_preamble_layout() {
        let bytes = preamble("net.tcp://h/x");
        assert_eq!(&bytes[..6], &[0x00, 0x01, 0x00, 0x01, 0x02, 0x02]);
        assert_eq!(bytes[6], 13);
        assert_eq!(&bytes[7..20], b"net.tcp://h/x");
        assert_eq!(&bytes[20..], &[0x03, 0x03]);
    }

    #[tokio::test]
    async fn test_negotiate_upgrade_and_preamble_end() {
        let (mut client, mut server) = duplex(4096);
        let server_task = tokio::spawn(async move {
            let expected = {
                let mut v = preamble("net.tcp://h/x");
                v.push(RECORD_UPGRADE_REQUEST);
                v.push(UPGRADE_SSL.len() as u8);
                v.extend_from_slice(UPGRADE_SSL.as_bytes());
                v
            };
            let mut got = vec![0u8; expected.len()];
            server.read_exact(&mut got).await.unwrap();
            assert_eq!(got, expected);
            server.write_all(&[RECORD_UPGRADE_RESPONSE]).await.unwrap();
            assert_eq!(server.read_u8().await.unwrap(), RECORD_PREAMBLE_END);
            server.write_all(&[RECORD_PREAMBLE_ACK]).await.unwrap();
        });
        negotiate_upgrade(&mut client, "net.tcp://h/x").await.unwrap();
        finish_preamble(&mut client).await.unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_upgrade_rejected_with_fault() {
        let (mut client, mut server) = duplex(4096);
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let _ = server.read(&mut buf).await;
            let fault = b"http://schemas.microsoft.com/ws/2006/05/framing/faults/UnsupportedVersion";
            let mut out = vec![RECORD_FAULT, fault.len() as u8];
            out.extend_from_slice(fault);
            server.write_all(&out).await.unwrap();
        });
        let err = negotiate_upgrade(&mut client, "net.tcp://h/x").await.unwrap_err();
        assert!(err.to_string().contains("UnsupportedVersion"));
    }

    #[tokio::test]
    async fn test_binary_only_endpoint_reports_content_type_fault() {
        let (mut client, mut server) = duplex(4096);
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let _ = server.read(&mut buf).await;
            let fault = b"http://schemas.microsoft.com/ws/2006/05/framing/faults/ContentTypeInvalid";
            let mut out = vec![RECORD_FAULT, fault.len() as u8];
            out.extend_from_slice(fault);
            server.write_all(&out).await.unwrap();
        });
        assert!(preamble("net.tcp://h/x").ends_with(&[RECORD_KNOWN_ENCODING, ENCODING_SOAP12_UTF8]));
        let err = negotiate_upgrade(&mut client, "net.tcp://h/x").await.unwrap_err();
        assert!(err.to_string().contains("ContentTypeInvalid"));
    }

    #[tokio::test]
    async fn test_channel_request_roundtrip_with_security_header() {
        let (client, mut server) = duplex(64 * 1024);
        let server_task = tokio::spawn(async move {
            assert_eq!(server.read_u8().await.unwrap(), RECORD_SIZED_ENVELOPE);
            let request = String::from_utf8(read_sized(&mut server).await.unwrap()).unwrap();
            send_envelope(&mut server, "<reply/>").await.unwrap();
            request
        });
        let channel = NmfChannel::new(
            "net.tcp://h/x".to_string(),
            client,
            Some(soap::security_header("bob@corp", "pw")),
        );
        let reply = channel
            .request(soap::ACTION_GET, "<s:Envelope><s:Header></s:Header></s:Envelope>".to_string())
            .await
            .unwrap();
        assert_eq!(reply, "<reply/>");
        let request = server_task.await.unwrap();
        assert!(request.starts_with("<s:Envelope><s:Header><o:Security"));
        assert!(!channel.is_closed());
    }

    #[tokio::test]
    async fn test_channel_closed_after_end_record() {
        let (client, mut server) = duplex(4096);
        tokio::spawn(async move {
            let _ = server.read_u8().await;
            let _ = read_sized(&mut server).await;
            server.write_all(&[RECORD_END]).await.unwrap();
        });
        let channel = NmfChannel::new("net.tcp://h/x".to_string(), client, None);
        let err = channel.request(soap::ACTION_PULL, "<x/>".to_string()).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<GatewayError>(), Some(GatewayError::Transport(_))));
        assert!(channel.is_closed());
        // no further traffic on a closed channel
        assert!(channel.request(soap::ACTION_PULL, "<x/>".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_close_sends_end_record() {
        let (client, mut server) = duplex(4096);
        let channel = NmfChannel::new("net.tcp://h/x".to_string(), client, None);
        channel.close().await;
        assert!(channel.is_closed());
        assert_eq!(server.read_u8().await.unwrap(), RECORD_END);
    }

    #[tokio::test]
    async fn test_windows_auth_rejected_at_connect() {
        let connector = NmfConnector::new(endpoint(true)).unwrap();
        let err = connector.connect(AdwsService::Resource).await.err().unwrap();
        assert!(err.to_string().contains("Windows integrated authentication"));
    }
}
