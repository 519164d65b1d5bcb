// LDAP protocol handling with BER encoding/decoding
// Covers the LDAP v3 subset the gateway answers: bind, unbind and search

use anyhow::{Context, Result, bail};
use std::io::{Cursor, Read};

use crate::error::GatewayError;

// LDAP Message structure
#[derive(Debug, Clone)]
pub struct LdapMessage {
    pub message_id: i32,
    pub protocol_op: ProtocolOp,
}

#[derive(Debug, Clone)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(BindResponse),
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchResultEntry),
    SearchResultDone(SearchResultDone),
    UnbindRequest,
    /// Any operation the gateway does not serve, kept by its application tag.
    Unsupported(u8),
}

#[derive(Debug, Clone)]
pub struct BindRequest {
    pub version: i32,
    pub name: String,
    pub authentication: BindAuthentication,
}

/// AuthenticationChoice, including the Sicily (NTLM) choices [9], [10] and [11]
/// that Windows clients send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAuthentication {
    Simple(String),
    Sasl { mechanism: String, credentials: Vec<u8> },
    NtlmPackageDiscovery,
    NtlmNegotiate(Vec<u8>),
    NtlmResponse(Vec<u8>),
    /// Context-specific choice number that has no meaning to us.
    Unknown(u8),
}

#[derive(Debug, Clone)]
pub struct BindResponse {
    pub result_code: i32,
    /// Raw bytes: NTLM challenges are carried here and must not be re-encoded as text.
    pub matched_dn: Vec<u8>,
    pub diagnostic_message: String,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub base_object: String,
    /// Scope code as received; validated when the search is dispatched.
    pub scope: u8,
    pub deref_aliases: u8,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    /// Complete filter TLVs in arrival order. Decoded by `filter` at dispatch time
    /// so that an unsupported operator fails the search, not the packet.
    pub filters: Vec<Vec<u8>>,
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

impl SearchScope {
    /// Scope keyword understood by the ADWS LdapQuery dialect.
    pub fn as_adws_str(&self) -> &'static str {
        match self {
            SearchScope::BaseObject => "base",
            SearchScope::SingleLevel => "onelevel",
            SearchScope::WholeSubtree => "subtree",
        }
    }
}

impl TryFrom<u8> for SearchScope {
    type Error = GatewayError;
    fn try_from(value: u8) -> std::result::Result<Self, GatewayError> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            _ => Err(GatewayError::UnsupportedScope(value)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchResultEntry {
    pub object_name: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone)]
pub struct SearchResultDone {
    pub result_code: i32,
    pub matched_dn: String,
    pub diagnostic_message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: String,
    pub attr_values: Vec<Vec<u8>>,
}

// BER parsing utilities
pub(crate) struct BerReader<'a> {
    pub(crate) cursor: Cursor<&'a [u8]>,
}

impl<'a> BerReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    pub(crate) fn read_tag(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    pub(crate) fn peek_tag(&self) -> Option<u8> {
        let pos = self.cursor.position() as usize;
        self.cursor.get_ref().get(pos).copied()
    }

    pub(crate) fn read_length(&mut self) -> Result<usize> {
        let mut buf = [0u8; 1];
        self.cursor.read_exact(&mut buf)?;
        let first_byte = buf[0];

        if (first_byte & 0x80) == 0 {
            // Short form
            Ok(first_byte as usize)
        } else {
            // Long form
            let length_bytes = (first_byte & 0x7F) as usize;
            if length_bytes == 0 {
                bail!("Indefinite length not supported");
            }
            if length_bytes > 4 {
                bail!("Length too large: {} bytes", length_bytes);
            }
            if self.remaining() < length_bytes {
                bail!("BER truncated: length encoding needs {} bytes, {} remaining", length_bytes, self.remaining());
            }
            let mut length = 0u32;
            for _ in 0..length_bytes {
                self.cursor.read_exact(&mut buf)?;
                length = (length << 8) | buf[0] as u32;
            }
            Ok(length as usize)
        }
    }

    pub(crate) fn read_integer(&mut self) -> Result<i32> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x02 {
            bail!("Expected INTEGER tag (0x02), got: 0x{:02X}", tag);
        }
        let length = self.read_length()?;
        if length == 0 || length > 4 {
            bail!("Invalid integer length: {} bytes", length);
        }
        let buf = self.read_slice(length)?;

        let mut value = 0i32;
        for &byte in buf {
            value = (value << 8) | (byte as i32);
        }

        // Sign extension for negative numbers
        if length < 4 && (buf[0] & 0x80) != 0 {
            value |= !0 << (length * 8);
        }

        Ok(value)
    }

    /// Read OCTET STRING TLV. Accepts: 0x04 (universal), 0x30 (SEQUENCE), or any context-specific tag 0x80..=0xBF.
    pub(crate) fn read_octet_string(&mut self) -> Result<Vec<u8>> {
        let tag = self.read_tag()?;
        let ok = (tag & 0x1F) == 0x04  // universal OCTET STRING
            || tag == 0x30              // SEQUENCE (some clients use for DN etc.)
            || (0x80..=0xBF).contains(&tag); // context-specific [0]..[31]
        if !ok {
            bail!("Expected OCTET STRING tag (0x04), got: 0x{:02X}", tag);
        }
        self.read_octet_string_value()
    }

    /// Read only length + value (tag already consumed). Use after read_tag() for [n] IMPLICIT etc.
    pub(crate) fn read_octet_string_value(&mut self) -> Result<Vec<u8>> {
        let length = self.read_length()?;
        Ok(self.read_slice(length)?.to_vec())
    }

    pub(crate) fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_octet_string()?;
        String::from_utf8(bytes).context("Invalid UTF-8 string")
    }

    pub(crate) fn read_sequence(&mut self) -> Result<usize> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x10 {
            bail!("Expected SEQUENCE tag, got: 0x{:02X}", tag);
        }
        self.read_length()
    }

    pub(crate) fn read_enumerated(&mut self) -> Result<u8> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x0A {
            bail!("Expected ENUMERATED tag, got: 0x{:02X}", tag);
        }
        let length = self.read_length()?;
        if length != 1 {
            bail!("Enumerated value must be 1 byte, got: {}", length);
        }
        let mut buf = [0u8; 1];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    pub(crate) fn read_boolean(&mut self) -> Result<bool> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x01 {
            bail!("Expected BOOLEAN tag, got: 0x{:02X}", tag);
        }
        let length = self.read_length()?;
        if length != 1 {
            bail!("Boolean value must be 1 byte, got: {}", length);
        }
        let mut buf = [0u8; 1];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf[0] != 0)
    }

    /// Read one TLV and return its tag and content, borrowed from the input.
    pub(crate) fn read_tlv(&mut self) -> Result<(u8, &'a [u8])> {
        let tag = self.read_tag()?;
        let length = self.read_length()?;
        Ok((tag, self.read_slice(length)?))
    }

    /// Read one TLV and return it whole (tag and length included).
    pub(crate) fn read_element(&mut self) -> Result<&'a [u8]> {
        let start = self.cursor.position() as usize;
        self.read_tlv()?;
        let end = self.cursor.position() as usize;
        let data: &'a [u8] = self.cursor.get_ref();
        Ok(&data[start..end])
    }

    pub(crate) fn remaining(&self) -> usize {
        let pos = self.cursor.position() as usize;
        let len = self.cursor.get_ref().len();
        len.saturating_sub(pos)
    }

    fn read_slice(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            bail!("BER truncated: need {} bytes, {} remaining", n, self.remaining());
        }
        let pos = self.cursor.position() as usize;
        let data: &'a [u8] = self.cursor.get_ref();
        self.cursor.set_position((pos + n) as u64);
        Ok(&data[pos..pos + n])
    }
}

// BER encoding utilities
#[derive(Default)]
pub struct BerWriter {
    buffer: Vec<u8>,
}

impl BerWriter {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
        }
    }

    pub fn write_tag(&mut self, tag: u8) {
        self.buffer.push(tag);
    }

    fn write_length(&mut self, length: usize) {
        if length < 128 {
            // Short form
            self.buffer.push(length as u8);
        } else {
            // Long form
            let bytes = length_bytes(length);
            self.buffer.push(0x80 | bytes.len() as u8);
            self.buffer.extend_from_slice(&bytes);
        }
    }

    pub fn write_integer(&mut self, value: i32) {
        self.write_tag(0x02); // INTEGER tag
        let bytes = value.to_be_bytes();
        // Drop leading octets that only repeat the sign bit of the next one.
        let mut start = 0;
        while start < bytes.len() - 1 {
            let next_negative = bytes[start + 1] & 0x80 != 0;
            match bytes[start] {
                0x00 if !next_negative => start += 1,
                0xFF if next_negative => start += 1,
                _ => break,
            }
        }
        self.write_length(bytes.len() - start);
        self.buffer.extend_from_slice(&bytes[start..]);
    }

    pub fn write_octet_string(&mut self, data: &[u8]) {
        self.write_tag(0x04); // OCTET STRING tag
        self.write_length(data.len());
        self.buffer.extend_from_slice(data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_octet_string(s.as_bytes());
    }

    #[cfg(test)]
    pub fn write_boolean(&mut self, value: bool) {
        self.write_tag(0x01); // BOOLEAN tag
        self.write_length(1);
        self.buffer.push(if value { 0xFF } else { 0x00 });
    }

    #[cfg(test)]
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn write_enumerated(&mut self, value: u8) {
        self.write_tag(0x0A); // ENUMERATED tag
        self.write_length(1);
        self.buffer.push(value);
    }

    /// Reserve a length byte (no tag). Used for [APPLICATION n] IMPLICIT SEQUENCE.
    /// Call patch_implicit_sequence_length(pos) after writing the content.
    pub fn write_length_placeholder(&mut self) -> usize {
        let pos = self.buffer.len();
        self.buffer.push(0);
        pos
    }

    /// Back-patch length at pos for content written after the placeholder.
    /// Supports short and long form.
    pub fn patch_implicit_sequence_length(&mut self, pos: usize) {
        let content_len = self.buffer.len() - (pos + 1);
        if content_len < 128 {
            self.buffer[pos] = content_len as u8;
        } else {
            let bytes = length_bytes(content_len);
            self.buffer[pos] = 0x80 | bytes.len() as u8;
            for (i, b) in bytes.iter().enumerate() {
                self.buffer.insert(pos + 1 + i, *b);
            }
        }
    }

    pub fn start_sequence(&mut self) -> usize {
        self.write_tag(0x30); // SEQUENCE tag
        self.write_length_placeholder()
    }

    pub fn end_sequence(&mut self, start_pos: usize) {
        self.patch_implicit_sequence_length(start_pos);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}

/// Minimal big-endian bytes of a long-form length.
fn length_bytes(length: usize) -> Vec<u8> {
    let mut bytes = Vec::new();
    let mut len = length;
    while len > 0 {
        bytes.push((len & 0xFF) as u8);
        len >>= 8;
    }
    bytes.reverse();
    bytes
}

// LDAP protocol tag constants
pub const LDAP_TAG_BIND_REQUEST: u8 = 0x60;
pub const LDAP_TAG_BIND_RESPONSE: u8 = 0x61;
pub const LDAP_TAG_UNBIND_REQUEST: u8 = 0x42;
pub const LDAP_TAG_SEARCH_REQUEST: u8 = 0x63;
pub const LDAP_TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const LDAP_TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const LDAP_TAG_ABANDON_REQUEST: u8 = 0x50;

/// SaslCredentials [3]
const BIND_AUTH_SASL: u8 = 0xA3;

/// LDAP result codes used by the gateway.
pub const RESULT_SUCCESS: i32 = 0;
pub const RESULT_OPERATIONS_ERROR: i32 = 1;
pub const RESULT_PROTOCOL_ERROR: i32 = 2;

/// Parse only the LDAP message header (SEQUENCE, messageID, protocolOp tag).
/// Returns (message_id, request_tag) for building error responses when full parse fails.
pub fn parse_ldap_message_header(data: &[u8]) -> Result<(i32, u8)> {
    let mut reader = BerReader::new(data);
    let _seq_len = reader.read_sequence()?;
    let message_id = reader.read_integer()?;
    let tag = reader.read_tag()?;
    Ok((message_id, tag))
}

pub fn parse_ldap_message(data: &[u8]) -> Result<LdapMessage> {
    let mut reader = BerReader::new(data);

    // LDAPMessage ::= SEQUENCE { messageID, protocolOp, controls [0] OPTIONAL }
    let _seq_len = reader.read_sequence()?;

    let message_id = reader.read_integer()?;

    let (tag, body) = reader.read_tlv()?;
    let protocol_op = match tag {
        LDAP_TAG_BIND_REQUEST => ProtocolOp::BindRequest(parse_bind_request(body)?),
        LDAP_TAG_UNBIND_REQUEST => ProtocolOp::UnbindRequest,
        LDAP_TAG_SEARCH_REQUEST => ProtocolOp::SearchRequest(parse_search_request(body)?),
        other => ProtocolOp::Unsupported(other),
    };

    // Request controls are accepted and ignored; the backend has no equivalent for them.
    Ok(LdapMessage {
        message_id,
        protocol_op,
    })
}

fn parse_bind_request(body: &[u8]) -> Result<BindRequest> {
    let mut reader = BerReader::new(body);
    let version = reader.read_integer()?;
    let name = reader.read_string()?;

    // RFC 4511 simple is [0] IMPLICIT OCTET STRING (0x80), but clients send various tags (0x41, 0x61, 0xD0, etc.).
    // Non context-specific tags are treated as simple bind (tag + OCTET STRING password).
    let auth_tag = reader.read_tag()?;
    let payload = reader.read_octet_string_value()?;
    let authentication = if auth_tag == BIND_AUTH_SASL {
        let mut sasl = BerReader::new(&payload);
        let mechanism = sasl.read_string()?;
        let credentials = if sasl.remaining() > 0 {
            sasl.read_octet_string()?
        } else {
            Vec::new()
        };
        BindAuthentication::Sasl { mechanism, credentials }
    } else if (auth_tag & 0xC0) == 0x80 {
        match auth_tag & 0x1F {
            0 => BindAuthentication::Simple(String::from_utf8_lossy(&payload).into_owned()),
            9 => BindAuthentication::NtlmPackageDiscovery,
            10 => BindAuthentication::NtlmNegotiate(payload),
            11 => BindAuthentication::NtlmResponse(payload),
            choice => BindAuthentication::Unknown(choice),
        }
    } else {
        BindAuthentication::Simple(String::from_utf8_lossy(&payload).into_owned())
    };

    Ok(BindRequest {
        version,
        name,
        authentication,
    })
}

fn parse_search_request(body: &[u8]) -> Result<SearchRequest> {
    let mut reader = BerReader::new(body);
    let base_object = reader.read_string()?;
    let scope = reader.read_enumerated()?;
    let deref_aliases = reader.read_enumerated()?;
    let size_limit = reader.read_integer()?;
    let time_limit = reader.read_integer()?;
    let types_only = reader.read_boolean()?;

    // Filter: every context-specific element before the attribute list
    let mut filters = Vec::new();
    while let Some(tag) = reader.peek_tag() {
        if (tag & 0xC0) != 0x80 {
            break;
        }
        filters.push(reader.read_element()?.to_vec());
    }

    // Attributes
    let mut attributes = Vec::new();
    if reader.remaining() > 0 {
        let (_attrs_tag, list) = reader.read_tlv()?;
        let mut attrs = BerReader::new(list);
        while attrs.remaining() > 0 {
            attributes.push(attrs.read_string()?);
        }
    }

    Ok(SearchRequest {
        base_object,
        scope,
        deref_aliases,
        size_limit,
        time_limit,
        types_only,
        filters,
        attributes,
    })
}

pub fn encode_ldap_message(message: &LdapMessage) -> Result<Vec<u8>> {
    let mut writer = BerWriter::new();
    let seq_start = writer.start_sequence();

    writer.write_integer(message.message_id);

    match &message.protocol_op {
        ProtocolOp::BindResponse(resp) => {
            encode_bind_response(&mut writer, resp);
        }
        ProtocolOp::SearchResultEntry(entry) => {
            encode_search_result_entry(&mut writer, entry);
        }
        ProtocolOp::SearchResultDone(done) => {
            encode_search_result_done(&mut writer, done);
        }
        _ => bail!("Cannot encode operation type"),
    }

    writer.end_sequence(seq_start);
    Ok(writer.into_vec())
}

fn encode_bind_response(writer: &mut BerWriter, resp: &BindResponse) {
    writer.write_tag(LDAP_TAG_BIND_RESPONSE);
    let len_pos = writer.write_length_placeholder();
    writer.write_enumerated(resp.result_code as u8);
    writer.write_octet_string(&resp.matched_dn);
    writer.write_string(&resp.diagnostic_message);
    writer.patch_implicit_sequence_length(len_pos);
}

fn encode_search_result_entry(writer: &mut BerWriter, entry: &SearchResultEntry) {
    writer.write_tag(LDAP_TAG_SEARCH_RESULT_ENTRY);
    let len_pos = writer.write_length_placeholder();
    writer.write_string(&entry.object_name);
    let attrs_start = writer.start_sequence();
    for attr in &entry.attributes {
        encode_attribute(writer, attr);
    }
    writer.end_sequence(attrs_start);
    writer.patch_implicit_sequence_length(len_pos);
}

fn encode_search_result_done(writer: &mut BerWriter, done: &SearchResultDone) {
    writer.write_tag(LDAP_TAG_SEARCH_RESULT_DONE);
    let len_pos = writer.write_length_placeholder();
    writer.write_enumerated(done.result_code as u8);
    writer.write_string(&done.matched_dn);
    writer.write_string(&done.diagnostic_message);
    writer.patch_implicit_sequence_length(len_pos);
}

fn encode_attribute(writer: &mut BerWriter, attr: &Attribute) {
    let seq_start = writer.start_sequence();
    writer.write_string(&attr.attr_type);

    // vals SET OF
    writer.write_tag(0x31);
    let vals_pos = writer.write_length_placeholder();
    for value in &attr.attr_values {
        writer.write_octet_string(value);
    }
    writer.patch_implicit_sequence_length(vals_pos);

    writer.end_sequence(seq_start);
}
