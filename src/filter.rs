// LDAP search filter decoding (RFC 4511 Filter CHOICE) and rendering to the
// RFC 4515 string form accepted by the ADWS LdapQuery dialect.

use anyhow::{Result, bail};
use std::fmt::Write as _;
use tracing::debug;

use crate::error::GatewayError;
use crate::ldap_protocol::BerReader;

const FILTER_AND: u8 = 0xA0;
const FILTER_OR: u8 = 0xA1;
const FILTER_NOT: u8 = 0xA2;
const FILTER_EQUALITY: u8 = 0xA3;
const FILTER_SUBSTRINGS: u8 = 0xA4;
const FILTER_GREATER_OR_EQUAL: u8 = 0xA5;
const FILTER_LESS_OR_EQUAL: u8 = 0xA6;
const FILTER_PRESENT: u8 = 0x87;
const FILTER_APPROX: u8 = 0xA8;
const FILTER_EXTENSIBLE: u8 = 0xA9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubstringPosition {
    Initial,
    Any,
    Final,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    EqualityMatch { attribute: String, value: Vec<u8> },
    /// Only the first substring component is kept.
    Substrings { attribute: String, position: SubstringPosition, value: Vec<u8> },
    GreaterOrEqual { attribute: String, value: Vec<u8> },
    LessOrEqual { attribute: String, value: Vec<u8> },
    Present { attribute: String },
    ApproxMatch { attribute: String, value: Vec<u8> },
    /// The first three components of the MatchingRuleAssertion, positionally.
    ExtensibleMatch { attribute: String, value: Vec<u8>, flag: Vec<u8> },
}

impl Filter {
    /// Decode one complete filter TLV.
    pub fn decode(data: &[u8]) -> Result<Filter> {
        let mut reader = BerReader::new(data);
        let filter = decode_filter(&mut reader)?;
        if reader.remaining() > 0 {
            bail!("Trailing {} bytes after filter", reader.remaining());
        }
        Ok(filter)
    }

    /// Render as a parenthesized filter string.
    pub fn translate(&self) -> String {
        let mut out = String::new();
        self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut String) {
        out.push('(');
        match self {
            Filter::And(children) => {
                out.push('&');
                children.iter().for_each(|c| c.write_to(out));
            }
            Filter::Or(children) => {
                out.push('|');
                children.iter().for_each(|c| c.write_to(out));
            }
            Filter::Not(child) => {
                out.push('!');
                child.write_to(out);
            }
            Filter::EqualityMatch { attribute, value } => {
                let rendered = if attribute.eq_ignore_ascii_case("objectsid") {
                    sid_or_text(value)
                } else {
                    escape_value(value)
                };
                let _ = write!(out, "{}={}", attribute, rendered);
            }
            Filter::Substrings { attribute, position, value } => {
                let value = escape_value(value);
                let _ = match position {
                    SubstringPosition::Initial => write!(out, "{}={}*", attribute, value),
                    SubstringPosition::Any => write!(out, "{}=*{}*", attribute, value),
                    SubstringPosition::Final => write!(out, "{}=*{}", attribute, value),
                };
            }
            Filter::GreaterOrEqual { attribute, value } => {
                let _ = write!(out, "{}>={}", attribute, escape_value(value));
            }
            Filter::LessOrEqual { attribute, value } => {
                let _ = write!(out, "{}<={}", attribute, escape_value(value));
            }
            Filter::Present { attribute } => {
                let _ = write!(out, "{}=*", attribute);
            }
            Filter::ApproxMatch { attribute, value } => {
                let _ = write!(out, "{}~={}", attribute, escape_value(value));
            }
            Filter::ExtensibleMatch { attribute, value, flag } => {
                let value = escape_value(value);
                if flag.as_slice() == [0xFF] {
                    let _ = write!(out, "{}:dn:={}", attribute, value);
                } else {
                    // Operand order follows what the directory backend has been observed to accept.
                    let _ = write!(out, "{}:{}:={}", value, attribute, String::from_utf8_lossy(flag));
                }
            }
        }
        out.push(')');
    }
}

/// Decode every top-level fragment of a search request.
pub fn decode_fragments(fragments: &[Vec<u8>]) -> Result<Vec<Filter>> {
    fragments.iter().map(|f| Filter::decode(f)).collect()
}

/// Render each fragment, parenthesize it if needed, and concatenate.
pub fn translate_fragments(filters: &[Filter]) -> String {
    filters
        .iter()
        .map(|f| {
            let text = f.translate();
            if text.starts_with('(') {
                text
            } else {
                format!("({})", text)
            }
        })
        .collect()
}

fn decode_filter(reader: &mut BerReader<'_>) -> Result<Filter> {
    let (tag, body) = reader.read_tlv()?;
    let filter = match tag {
        FILTER_AND => Filter::And(decode_set(body)?),
        FILTER_OR => Filter::Or(decode_set(body)?),
        FILTER_NOT => {
            let mut inner = BerReader::new(body);
            Filter::Not(Box::new(decode_filter(&mut inner)?))
        }
        FILTER_EQUALITY => {
            let (attribute, value) = decode_assertion(body)?;
            Filter::EqualityMatch { attribute, value }
        }
        FILTER_SUBSTRINGS => decode_substrings(body)?,
        FILTER_GREATER_OR_EQUAL => {
            let (attribute, value) = decode_assertion(body)?;
            Filter::GreaterOrEqual { attribute, value }
        }
        FILTER_LESS_OR_EQUAL => {
            let (attribute, value) = decode_assertion(body)?;
            Filter::LessOrEqual { attribute, value }
        }
        FILTER_PRESENT => Filter::Present {
            attribute: String::from_utf8_lossy(body).into_owned(),
        },
        FILTER_APPROX => {
            let (attribute, value) = decode_assertion(body)?;
            Filter::ApproxMatch { attribute, value }
        }
        FILTER_EXTENSIBLE => decode_extensible(body)?,
        other => return Err(GatewayError::UnsupportedFilterOperator(other & 0x1F).into()),
    };
    Ok(filter)
}

fn decode_set(body: &[u8]) -> Result<Vec<Filter>> {
    let mut reader = BerReader::new(body);
    let mut children = Vec::new();
    while reader.remaining() > 0 {
        children.push(decode_filter(&mut reader)?);
    }
    Ok(children)
}

/// AttributeValueAssertion ::= SEQUENCE { attributeDesc, assertionValue }
fn decode_assertion(body: &[u8]) -> Result<(String, Vec<u8>)> {
    let mut reader = BerReader::new(body);
    let attribute = reader.read_string()?;
    let value = reader.read_octet_string()?;
    Ok((attribute, value))
}

fn decode_substrings(body: &[u8]) -> Result<Filter> {
    let mut reader = BerReader::new(body);
    let attribute = reader.read_string()?;
    let (_seq_tag, components) = reader.read_tlv()?;
    let mut components = BerReader::new(components);
    let (tag, value) = components.read_tlv()?;
    let position = match tag {
        0x80 => SubstringPosition::Initial,
        0x81 => SubstringPosition::Any,
        0x82 => SubstringPosition::Final,
        other => return Err(GatewayError::UnsupportedFilterOperator(other & 0x1F).into()),
    };
    if components.remaining() > 0 {
        debug!("Substring filter on {} has extra components; only the first is used", attribute);
    }
    Ok(Filter::Substrings {
        attribute,
        position,
        value: value.to_vec(),
    })
}

fn decode_extensible(body: &[u8]) -> Result<Filter> {
    let mut reader = BerReader::new(body);
    let mut parts = Vec::with_capacity(3);
    while parts.len() < 3 && reader.remaining() > 0 {
        let (_tag, value) = reader.read_tlv()?;
        parts.push(value.to_vec());
    }
    if parts.len() < 3 {
        bail!("Extensible match needs 3 components, got {}", parts.len());
    }
    let flag = parts.pop().unwrap_or_default();
    let value = parts.pop().unwrap_or_default();
    let attribute = String::from_utf8_lossy(&parts.pop().unwrap_or_default()).into_owned();
    Ok(Filter::ExtensibleMatch { attribute, value, flag })
}

/// RFC 4515 value escaping for the characters that would change the filter's structure.
/// Bytes that are not valid UTF-8 are written as `\hh`.
fn escape_value(value: &[u8]) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while !rest.is_empty() {
        match std::str::from_utf8(rest) {
            Ok(text) => {
                escape_text(text, &mut out);
                break;
            }
            Err(e) => {
                let (valid, invalid) = rest.split_at(e.valid_up_to());
                escape_text(std::str::from_utf8(valid).unwrap_or_default(), &mut out);
                let bad = e.error_len().unwrap_or(invalid.len());
                for b in &invalid[..bad] {
                    let _ = write!(out, "\\{:02x}", b);
                }
                rest = &invalid[bad..];
            }
        }
    }
    out
}

fn escape_text(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '*' => out.push_str("\\2a"),
            '\\' => out.push_str("\\5c"),
            '\0' => out.push_str("\\00"),
            c => out.push(c),
        }
    }
}

fn sid_or_text(value: &[u8]) -> String {
    match format_sid(value) {
        Some(sid) => sid,
        None => {
            debug!("objectSid value of {} bytes is not a security identifier, using UTF-8", value.len());
            escape_value(value)
        }
    }
}

/// Binary SID to `S-1-<authority>-<sub>...`.
pub fn format_sid(bytes: &[u8]) -> Option<String> {
    if bytes.len() < 8 || bytes[0] != 1 {
        return None;
    }
    let count = bytes[1] as usize;
    if count > 15 || bytes.len() < 8 + 4 * count {
        return None;
    }
    let authority = bytes[2..8]
        .iter()
        .fold(0u64, |acc, &b| (acc << 8) | b as u64);

    let mut sid = String::from("S-1-");
    if authority < (1u64 << 32) {
        let _ = write!(sid, "{}", authority);
    } else {
        let _ = write!(sid, "0x{:012X}", authority);
    }
    for chunk in bytes[8..8 + 4 * count].chunks_exact(4) {
        let sub = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        let _ = write!(sid, "-{}", sub);
    }
    Some(sid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use ldap3::asn1::{ASNTag, write};

    /// Encode an RFC 4515 string with an independent LDAP implementation.
    fn ber(filter: &str) -> Vec<u8> {
        let tag = ldap3::parse_filter(filter).expect("valid filter");
        let mut buf = BytesMut::new();
        write::encode_into(&mut buf, tag.into_structure()).expect("encode");
        buf.to_vec()
    }

    fn roundtrip(filter: &str) -> String {
        Filter::decode(&ber(filter)).unwrap().translate()
    }

    fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
        let mut v = vec![tag, content.len() as u8];
        v.extend_from_slice(content);
        v
    }

    fn octets(s: &[u8]) -> Vec<u8> {
        tlv(0x04, s)
    }

    #[test]
    fn test_and_with_present() {
        assert_eq!(roundtrip("(&(cn=alice)(mail=*))"), "(&(cn=alice)(mail=*))");
    }

    #[test]
    fn test_substrings_positions() {
        assert_eq!(roundtrip("(cn=*bob*)"), "(cn=*bob*)");
        assert_eq!(roundtrip("(cn=bob*)"), "(cn=bob*)");
        assert_eq!(roundtrip("(cn=*bob)"), "(cn=*bob)");
    }

    #[test]
    fn test_nested_boolean_operators() {
        assert_eq!(
            roundtrip("(|(objectClass=user)(!(sAMAccountName=krbtgt)))"),
            "(|(objectClass=user)(!(sAMAccountName=krbtgt)))"
        );
    }

    #[test]
    fn test_ordering_and_approx() {
        assert_eq!(roundtrip("(uSNChanged>=1000)"), "(uSNChanged>=1000)");
        assert_eq!(roundtrip("(pwdLastSet<=5)"), "(pwdLastSet<=5)");
        assert_eq!(roundtrip("(cn~=bob)"), "(cn~=bob)");
    }

    #[test]
    fn test_extensible_dn_match() {
        assert_eq!(roundtrip("(cn:dn:=foo)"), "(cn:dn:=foo)");
    }

    #[test]
    fn test_extensible_rule_keeps_backend_operand_order() {
        // [1] rule, [2] type, [3] value read positionally as attribute, value, flag
        let mut body = tlv(0x81, b"1.2.840.113556.1.4.803");
        body.extend(tlv(0x82, b"userAccountControl"));
        body.extend(tlv(0x83, b"2"));
        let filter = Filter::decode(&tlv(0xA9, &body)).unwrap();
        assert_eq!(
            filter.translate(),
            "(userAccountControl:1.2.840.113556.1.4.803:=2)"
        );
    }

    #[test]
    fn test_extensible_with_two_components_is_an_error() {
        let mut body = tlv(0x82, b"cn");
        body.extend(tlv(0x83, b"foo"));
        assert!(Filter::decode(&tlv(0xA9, &body)).is_err());
    }

    #[test]
    fn test_object_sid_renders_canonical_form() {
        let sid = [
            0x01, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05, // revision 1, 5 subauths, NT authority
            0x15, 0x00, 0x00, 0x00, // 21
            0x01, 0x02, 0x03, 0x04, // 67305985
            0x05, 0x06, 0x07, 0x08, // 134678021
            0x09, 0x0A, 0x0B, 0x0C, // 202050057
            0xF4, 0x01, 0x00, 0x00, // 500
        ];
        let mut body = octets(b"objectSid");
        body.extend(octets(&sid));
        let filter = Filter::decode(&tlv(0xA3, &body)).unwrap();
        assert_eq!(
            filter.translate(),
            "(objectSid=S-1-5-21-67305985-134678021-202050057-500)"
        );
    }

    #[test]
    fn test_object_sid_attribute_name_is_case_insensitive() {
        let sid = [0x01, 0x01, 0, 0, 0, 0, 0, 0x05, 0x12, 0, 0, 0];
        let mut body = octets(b"OBJECTSID");
        body.extend(octets(&sid));
        assert_eq!(Filter::decode(&tlv(0xA3, &body)).unwrap().translate(), "(OBJECTSID=S-1-5-18)");
    }

    #[test]
    fn test_object_sid_fallback_to_text() {
        let mut body = octets(b"objectSid");
        body.extend(octets(b"S-1-5-32-544"));
        assert_eq!(
            Filter::decode(&tlv(0xA3, &body)).unwrap().translate(),
            "(objectSid=S-1-5-32-544)"
        );
    }

    #[test]
    fn test_format_sid_large_authority_and_invalid_input() {
        let sid = [0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(format_sid(&sid).as_deref(), Some("S-1-0x010000000000"));
        assert_eq!(format_sid(&[0x02, 0x00, 0, 0, 0, 0, 0, 0]), None);
        assert_eq!(format_sid(&[0x01, 0x02, 0, 0, 0, 0, 0, 5, 1, 0, 0, 0]), None);
        assert_eq!(format_sid(&[0x01]), None);
    }

    #[test]
    fn test_values_are_escaped() {
        let mut body = octets(b"cn");
        body.extend(octets(b"a(b)*c\\"));
        assert_eq!(
            Filter::decode(&tlv(0xA3, &body)).unwrap().translate(),
            "(cn=a\\28b\\29\\2ac\\5c)"
        );
        assert_eq!(roundtrip("(cn=a\\2ab)"), "(cn=a\\2ab)");
    }

    #[test]
    fn test_binary_values_are_hex_escaped() {
        let guid = [0x61, 0xFF, 0x28, 0xC3, 0x00, 0xE9];
        let mut body = octets(b"objectGUID");
        body.extend(octets(&guid));
        assert_eq!(
            Filter::decode(&tlv(0xA3, &body)).unwrap().translate(),
            "(objectGUID=a\\ff\\28\\c3\\00\\e9)"
        );
        assert_eq!(escape_value("é(".as_bytes()), "é\\28");
    }

    #[test]
    fn test_unknown_operator_is_error() {
        let err = Filter::decode(&tlv(0xAF, b"")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GatewayError>(),
            Some(GatewayError::UnsupportedFilterOperator(15))
        ));
    }

    #[test]
    fn test_unknown_operator_nested_is_error() {
        let inner = tlv(0xAB, b"");
        let err = Filter::decode(&tlv(0xA0, &inner)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GatewayError>(),
            Some(GatewayError::UnsupportedFilterOperator(11))
        ));
    }

    #[test]
    fn test_unknown_substring_position_is_error() {
        let mut body = octets(b"cn");
        body.extend(tlv(0x30, &tlv(0x85, b"x")));
        let err = Filter::decode(&tlv(0xA4, &body)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GatewayError>(),
            Some(GatewayError::UnsupportedFilterOperator(5))
        ));
    }

    #[test]
    fn test_fragments_are_parenthesized_and_concatenated() {
        let fragments = vec![ber("(objectClass=*)"), ber("(cn=alice)")];
        let filters = decode_fragments(&fragments).unwrap();
        assert_eq!(translate_fragments(&filters), "(objectClass=*)(cn=alice)");
    }
}
