use crate::adws_client::AdwsConnection;
use crate::backend::ChannelConnector;
use crate::config::EndpointConfig;
use crate::ldap_handler::LdapHandler;
use crate::metrics::Metrics;
use crate::ldap_protocol::{
    parse_ldap_message, parse_ldap_message_header, BerWriter, LdapMessage, ProtocolOp,
    LDAP_TAG_BIND_REQUEST, LDAP_TAG_BIND_RESPONSE, LDAP_TAG_SEARCH_REQUEST, LDAP_TAG_SEARCH_RESULT_DONE,
    RESULT_PROTOCOL_ERROR,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{error, info, warn, debug};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use bytes::BytesMut;

/// Result of trying to parse one LDAP message from the buffer.
pub enum TryParseResult {
    /// Not enough data yet.
    Incomplete,
    Message(LdapMessage),
    /// Parse failed; consume `consume` bytes and send error response (message_id, response_tag).
    ParseError {
        message_id: i32,
        response_tag: u8,
        consume: usize,
    },
}

/// One LDAP endpoint backed by one ADWS instance.
pub struct Listener {
    endpoint: Arc<EndpointConfig>,
    handler: Arc<LdapHandler>,
    metrics: Arc<Metrics>,
}

impl Listener {
    pub fn new(endpoint: EndpointConfig, connector: Arc<dyn ChannelConnector>, metrics: Arc<Metrics>) -> Self {
        let endpoint = Arc::new(endpoint);
        let connection = AdwsConnection::new(Arc::clone(&endpoint), connector).with_metrics(Arc::clone(&metrics));
        Self {
            endpoint,
            handler: Arc::new(LdapHandler::new(Arc::new(connection))),
            metrics,
        }
    }

    pub fn connection(&self) -> &Arc<AdwsConnection> {
        self.handler.connection()
    }

    pub fn instance(&self) -> &str {
        &self.endpoint.instance
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = parse_listen_addr(&self.endpoint.listen_addr)?;
        TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))
    }

    pub async fn start(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept loop. Each connection gets its own task.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr().context("Listener has no local address")?;
        info!(
            "LDAP listener on {} for instance {} (ADWS {}:{})",
            local, self.endpoint.instance, self.endpoint.server, self.endpoint.port
        );
        self.metrics.listener_started(&local.to_string(), &self.endpoint.instance);

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("New connection from {}", peer_addr);
                    let handler = Arc::clone(&self.handler);
                    let metrics = Arc::clone(&self.metrics);
                    metrics.inc_connections();

                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, peer_addr, handler, metrics).await {
                            error!("Error handling client {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

/// Accepts `host:port`, `:port` or `ldap://host:port`.
fn parse_listen_addr(addr: &str) -> Result<SocketAddr> {
    let addr = addr.strip_prefix("ldap://").unwrap_or(addr);
    let addr = addr.trim_start_matches('/');

    if addr.starts_with(':') {
        // Just port specified, bind to all interfaces
        let port: u16 = addr.trim_start_matches(':')
            .parse()
            .context("Invalid port number")?;
        Ok(SocketAddr::from(([0, 0, 0, 0], port)))
    } else {
        addr.parse()
            .with_context(|| format!("Failed to parse address: {}", addr))
    }
}

/// Session loop: packets are handled strictly one at a time in arrival order.
async fn handle_client(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<LdapHandler>,
    metrics: Arc<Metrics>,
) -> Result<()> {
    debug!("Handling client connection from {}", peer_addr);
    // Sessions start bound; the gateway performs no authentication of its own.
    let mut bound = true;
    let mut buffer = BytesMut::with_capacity(4096);

    'read_loop: loop {
        let mut read_buf = vec![0u8; 4096];
        match stream.read(&mut read_buf).await {
            Ok(0) => {
                debug!("Client {} disconnected", peer_addr);
                break;
            }
            Ok(n) => {
                buffer.extend_from_slice(&read_buf[..n]);
                loop {
                    let parse_result = match try_parse_message(&mut buffer) {
                        Ok(r) => r,
                        Err(e) => {
                            warn!("Invalid LDAP message from {}: {}", peer_addr, e);
                            metrics.inc_parse_error();
                            let err_data = encode_error_response(
                                0,
                                LDAP_TAG_BIND_RESPONSE,
                                RESULT_PROTOCOL_ERROR,
                                "",
                                "Invalid message",
                            );
                            stream.write_all(&err_data).await?;
                            stream.flush().await?;
                            buffer.clear();
                            break;
                        }
                    };
                    match parse_result {
                        TryParseResult::Incomplete => break,
                        TryParseResult::ParseError {
                            message_id,
                            response_tag,
                            consume,
                        } => {
                            metrics.inc_parse_error();
                            let first_byte = buffer.first().copied().unwrap_or(0);
                            debug!(
                                "Parse error from {} (first_byte=0x{:02X}, consume={}); sending protocolError",
                                peer_addr, first_byte, consume,
                            );
                            let err_data = encode_error_response(
                                message_id,
                                response_tag,
                                RESULT_PROTOCOL_ERROR,
                                "",
                                "Failed to parse LDAP message",
                            );
                            stream.write_all(&err_data).await?;
                            stream.flush().await?;
                            let consume = consume.min(buffer.len());
                            let _ = buffer.split_to(consume);
                        }
                        TryParseResult::Message(message) => {
                            info!("New LDAP packet received from {} (message ID {})", peer_addr, message.message_id);
                            let message_id = message.message_id;
                            let start = Instant::now();
                            match message.protocol_op {
                                ProtocolOp::BindRequest(ref bind) => {
                                    metrics.inc_request("bind");
                                    match handler.handle_bind(message_id, bind) {
                                        Ok(response) => {
                                            stream.write_all(&response).await?;
                                            stream.flush().await?;
                                            bound = true;
                                        }
                                        Err(e) => {
                                            metrics.inc_error("bind");
                                            error!("Failed to answer bind from {}: {}", peer_addr, e);
                                        }
                                    }
                                    metrics.observe_duration("bind", start.elapsed());
                                }
                                ProtocolOp::UnbindRequest => {
                                    debug!("Unbind from {}", peer_addr);
                                    bound = false;
                                    break 'read_loop;
                                }
                                ProtocolOp::SearchRequest(ref search) if bound => {
                                    let status = handler.handle_search(message_id, search, &mut stream).await?;
                                    metrics.inc_request(status.op);
                                    if status.failed {
                                        metrics.inc_error(status.op);
                                    }
                                    metrics.add_entries(status.entries);
                                    metrics.observe_duration(status.op, start.elapsed());
                                }
                                ProtocolOp::SearchRequest(_) => {
                                    debug!("Search from unbound client {} ignored", peer_addr);
                                }
                                ref other => {
                                    debug!("Ignoring unsupported operation from {}: {:?}", peer_addr, other);
                                }
                            }
                            info!("Packet handling done for {} (message ID {})", peer_addr, message_id);
                        }
                    }
                }
            }
            Err(e) => {
                error!("Error reading from client {}: {}", peer_addr, e);
                break;
            }
        }
    }

    debug!("Client handling done for {} (bound={})", peer_addr, bound);
    Ok(())
}

fn response_tag_for_request(request_tag: u8) -> u8 {
    match request_tag {
        LDAP_TAG_BIND_REQUEST => LDAP_TAG_BIND_RESPONSE,
        LDAP_TAG_SEARCH_REQUEST => LDAP_TAG_SEARCH_RESULT_DONE,
        _ => LDAP_TAG_BIND_RESPONSE, // fallback so we can send an error
    }
}

/// Top-level LDAP message is always a SEQUENCE (BER tag 0x30). If the stream
/// starts with another tag (e.g. 0x04 OCTET STRING), we're either seeing
/// invalid client data or the remainder of a message after a framing error.
const LDAP_MESSAGE_SEQUENCE_TAG: u8 = 0x30;

fn try_parse_message(buffer: &mut BytesMut) -> Result<TryParseResult> {
    if buffer.len() < 2 {
        return Ok(TryParseResult::Incomplete);
    }

    let first_byte = buffer[0];
    // Unwrap OCTET STRING–wrapped LDAP: some clients send 0x04 <len> <LDAP message (0x30...)>.
    if first_byte == 0x04 {
        let (content_len, header_len) = match read_frame_length(buffer)? {
            Some(frame) => frame,
            None => return Ok(TryParseResult::Incomplete),
        };
        let outer_total = header_len + content_len;
        if buffer.len() < outer_total {
            return Ok(TryParseResult::Incomplete);
        }
        let inner = &buffer[header_len..outer_total];
        return Ok(match parse_ldap_message(inner) {
            Ok(msg) => {
                let _ = buffer.split_to(outer_total);
                TryParseResult::Message(msg)
            }
            Err(e) => {
                warn!("Failed to parse 0x04-wrapped LDAP message: {} (inner first 64 bytes: {})", e, hex_preview(inner));
                let (message_id, request_tag) = parse_ldap_message_header(inner).unwrap_or((0, LDAP_TAG_BIND_REQUEST));
                TryParseResult::ParseError {
                    message_id,
                    response_tag: response_tag_for_request(request_tag),
                    consume: outer_total,
                }
            }
        });
    }
    if first_byte != LDAP_MESSAGE_SEQUENCE_TAG {
        return Ok(TryParseResult::ParseError {
            message_id: 0,
            response_tag: LDAP_TAG_BIND_RESPONSE,
            consume: 1,
        });
    }

    let (content_len, header_len) = match read_frame_length(buffer)? {
        Some(frame) => frame,
        None => return Ok(TryParseResult::Incomplete),
    };
    let total_length = header_len + content_len;
    if buffer.len() < total_length {
        // Not enough data yet
        return Ok(TryParseResult::Incomplete);
    }

    let slice = &buffer[..total_length];
    match parse_ldap_message(slice) {
        Ok(msg) => {
            let _ = buffer.split_to(total_length);
            Ok(TryParseResult::Message(msg))
        }
        Err(e) => {
            warn!("Failed to parse LDAP message: {} (first 64 bytes: {})", e, hex_preview(slice));
            let (message_id, request_tag) = parse_ldap_message_header(slice).unwrap_or((0, LDAP_TAG_BIND_REQUEST));
            Ok(TryParseResult::ParseError {
                message_id,
                response_tag: response_tag_for_request(request_tag),
                consume: total_length,
            })
        }
    }
}

/// Length of the outer TLV as (content length, header length). None while the length bytes are incomplete.
fn read_frame_length(buffer: &[u8]) -> Result<Option<(usize, usize)>> {
    let first = buffer[1];
    if (first & 0x80) == 0 {
        return Ok(Some((first as usize, 2)));
    }
    let length_bytes = (first & 0x7F) as usize;
    if length_bytes == 0 || length_bytes > 4 {
        anyhow::bail!("Invalid length encoding");
    }
    if buffer.len() < 2 + length_bytes {
        return Ok(None);
    }
    let mut length = 0usize;
    for i in 0..length_bytes {
        length = (length << 8) | buffer[2 + i] as usize;
    }
    Ok(Some((length, 2 + length_bytes)))
}

fn hex_preview(data: &[u8]) -> String {
    data.iter()
        .take(64)
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn encode_error_response(
    message_id: i32,
    response_tag: u8,
    result_code: i32,
    matched_dn: &str,
    diagnostic_message: &str,
) -> Vec<u8> {
    let mut writer = BerWriter::new();
    let seq_start = writer.start_sequence();
    writer.write_integer(message_id);
    writer.write_tag(response_tag);
    let len_pos = writer.write_length_placeholder();
    writer.write_enumerated(result_code as u8);
    writer.write_string(matched_dn);
    writer.write_string(diagnostic_message);
    writer.patch_implicit_sequence_length(len_pos);
    writer.end_sequence(seq_start);
    writer.into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adws_client::tests::{test_endpoint, ScriptedChannel, ScriptedConnector};
    use crate::ldap_protocol::tests::{present_filter, search_request_bytes, wrap_message};
    use crate::ldap_protocol::{BerReader, LDAP_TAG_SEARCH_RESULT_ENTRY, LDAP_TAG_UNBIND_REQUEST};
    use crate::soap;
    use crate::soap::tests::{enumerate_response_xml, pull_response_xml, response};

    async fn start_listener(channel: Arc<ScriptedChannel>) -> (SocketAddr, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let mut endpoint = (*test_endpoint()).clone();
        endpoint.listen_addr = "127.0.0.1:0".to_string();
        let listener = Listener::new(
            endpoint,
            Arc::new(ScriptedConnector::new(vec![channel])),
            Arc::clone(&metrics),
        );
        let tcp = listener.bind().await.unwrap();
        let addr = tcp.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.serve(tcp).await;
        });
        (addr, metrics)
    }

    /// Read one whole LDAPMessage and return (message id, op tag, op body).
    async fn read_message(stream: &mut TcpStream) -> (i32, u8, Vec<u8>) {
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], 0x30);
        let mut raw = header.to_vec();
        let len = if header[1] & 0x80 == 0 {
            header[1] as usize
        } else {
            let mut len_bytes = vec![0u8; (header[1] & 0x7F) as usize];
            stream.read_exact(&mut len_bytes).await.unwrap();
            raw.extend_from_slice(&len_bytes);
            len_bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize)
        };
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();
        raw.extend_from_slice(&body);

        let mut reader = BerReader::new(&raw);
        reader.read_sequence().unwrap();
        let id = reader.read_integer().unwrap();
        let (tag, op) = reader.read_tlv().unwrap();
        (id, tag, op.to_vec())
    }

    fn result_code(op: &[u8]) -> u8 {
        BerReader::new(op).read_enumerated().unwrap()
    }

    fn bind_bytes(message_id: i32, auth_tag: u8) -> Vec<u8> {
        let mut body = BerWriter::new();
        body.write_integer(3);
        body.write_string("");
        body.write_tag(auth_tag);
        // empty credentials
        body.write_raw(&[0x00]);
        wrap_message(message_id, LDAP_TAG_BIND_REQUEST, &body.into_vec())
    }

    #[test]
    fn test_parse_listen_addr() {
        let addr = parse_listen_addr("127.0.0.1:1389").unwrap();
        assert_eq!(addr.port(), 1389);
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_eq!(parse_listen_addr("0.0.0.0:389").unwrap().port(), 389);
    }

    #[test]
    fn test_parse_listen_addr_url_and_port_only() {
        let addr = parse_listen_addr("ldap://:1389").unwrap();
        assert_eq!(addr.port(), 1389);
        assert_eq!(addr.ip().to_string(), "0.0.0.0");
        assert_eq!(parse_listen_addr("ldap:///127.0.0.1:3268").unwrap().port(), 3268);
    }

    #[test]
    fn test_parse_listen_addr_invalid() {
        assert!(parse_listen_addr(":99999").is_err());
        assert!(parse_listen_addr(":abc").is_err());
        assert!(parse_listen_addr("invalid:address").is_err());
    }

    #[test]
    fn test_encode_error_response() {
        let response = encode_error_response(3, LDAP_TAG_SEARCH_RESULT_DONE, RESULT_PROTOCOL_ERROR, "", "bad");
        let mut reader = BerReader::new(&response);
        reader.read_sequence().unwrap();
        assert_eq!(reader.read_integer().unwrap(), 3);
        let (tag, op) = reader.read_tlv().unwrap();
        assert_eq!(tag, LDAP_TAG_SEARCH_RESULT_DONE);
        assert_eq!(result_code(op), 2);
    }

    #[test]
    fn test_try_parse_incomplete_and_garbage() {
        let full = search_request_bytes(1, "", 0, &[present_filter("objectClass")], &[]);
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(matches!(try_parse_message(&mut partial).unwrap(), TryParseResult::Incomplete));
        assert_eq!(partial.len(), full.len() - 1);

        let mut garbage = BytesMut::from(&[0xFFu8, 0x00][..]);
        assert!(matches!(
            try_parse_message(&mut garbage).unwrap(),
            TryParseResult::ParseError { message_id: 0, consume: 1, .. }
        ));
    }

    #[test]
    fn test_try_parse_truncated_search_reports_search_done() {
        // SEQUENCE { id 1, [APPLICATION 3] {} }
        let mut buffer = BytesMut::from(&[0x30u8, 0x05, 0x02, 0x01, 0x01, 0x63, 0x00][..]);
        match try_parse_message(&mut buffer).unwrap() {
            TryParseResult::ParseError { message_id, response_tag, consume } => {
                assert_eq!(message_id, 1);
                assert_eq!(response_tag, LDAP_TAG_SEARCH_RESULT_DONE);
                assert_eq!(consume, 7);
            }
            _ => panic!("expected parse error"),
        }
    }

    #[test]
    fn test_try_parse_octet_string_wrapped() {
        let inner = search_request_bytes(2, "", 0, &[present_filter("objectClass")], &[]);
        let mut wrapped = vec![0x04, inner.len() as u8];
        wrapped.extend_from_slice(&inner);
        let mut buffer = BytesMut::from(&wrapped[..]);
        match try_parse_message(&mut buffer).unwrap() {
            TryParseResult::Message(msg) => assert_eq!(msg.message_id, 2),
            _ => panic!("expected message"),
        }
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_bind_mechanism_succeeds() {
        let (addr, metrics) = start_listener(Arc::new(ScriptedChannel::new("net.tcp://x"))).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        // [5] is not an authentication choice we know
        client.write_all(&bind_bytes(1, 0x85)).await.unwrap();
        let (id, tag, op) = read_message(&mut client).await;
        assert_eq!((id, tag), (1, LDAP_TAG_BIND_RESPONSE));
        assert_eq!(result_code(&op), 0);
        assert!(metrics.render().contains("ldap_adws_requests_total{op=\"bind\"} 1"));
    }

    #[tokio::test]
    async fn test_malformed_packet_then_search_on_same_connection() {
        let channel = Arc::new(
            ScriptedChannel::new("net.tcp://x")
                .respond(soap::ACTION_ENUMERATE, enumerate_response_xml("ctx", None))
                .respond(soap::ACTION_PULL, pull_response_xml(&["CN=a,DC=x", "CN=b,DC=x"], true))
                .respond(soap::ACTION_RELEASE, response("")),
        );
        let (addr, metrics) = start_listener(Arc::clone(&channel)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(&[0x30, 0x05, 0x02, 0x01, 0x01, 0x63, 0x00]).await.unwrap();
        let (id, tag, op) = read_message(&mut client).await;
        assert_eq!((id, tag), (1, LDAP_TAG_SEARCH_RESULT_DONE));
        assert_eq!(result_code(&op), 2);

        client
            .write_all(&search_request_bytes(2, "DC=x", 2, &[present_filter("cn")], &["cn"]))
            .await
            .unwrap();
        let mut tags = Vec::new();
        loop {
            let (id, tag, op) = read_message(&mut client).await;
            assert_eq!(id, 2);
            tags.push(tag);
            if tag == LDAP_TAG_SEARCH_RESULT_DONE {
                assert_eq!(result_code(&op), 0);
                break;
            }
        }
        assert_eq!(tags, vec![LDAP_TAG_SEARCH_RESULT_ENTRY, LDAP_TAG_SEARCH_RESULT_ENTRY, LDAP_TAG_SEARCH_RESULT_DONE]);
        assert_eq!(channel.actions(), vec!["Enumerate", "Pull", "Release"]);

        let rendered = metrics.render();
        assert!(rendered.contains("ldap_adws_parse_errors_total 1"));
        assert!(rendered.contains("ldap_adws_entries_total 2"));
    }

    #[tokio::test]
    async fn test_unbind_closes_connection() {
        let (addr, _) = start_listener(Arc::new(ScriptedChannel::new("net.tcp://x"))).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&wrap_message(1, LDAP_TAG_UNBIND_REQUEST, &[])).await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }
}
