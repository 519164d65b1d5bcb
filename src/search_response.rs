// Maps backend results onto SearchResultEntry / SearchResultDone messages

use crate::ldap_protocol::{
    encode_ldap_message, Attribute, LdapMessage, ProtocolOp, SearchResultDone, SearchResultEntry,
    RESULT_OPERATIONS_ERROR, RESULT_SUCCESS,
};
use crate::soap::{AttributeValue, Entry};
use anyhow::Result;

/// Group values by attribute name, keeping the order in which names first appear.
fn group_attributes(values: &[AttributeValue]) -> Vec<Attribute> {
    let mut attributes: Vec<Attribute> = Vec::new();
    for value in values {
        match attributes.iter_mut().find(|a| a.attr_type == value.name) {
            Some(attr) => attr.attr_values.push(value.value.as_bytes().to_vec()),
            None => attributes.push(Attribute {
                attr_type: value.name.clone(),
                attr_values: vec![value.value.as_bytes().to_vec()],
            }),
        }
    }
    attributes
}

fn entry_message(message_id: i32, dn: &str, values: &[AttributeValue]) -> Result<Vec<u8>> {
    encode_ldap_message(&LdapMessage {
        message_id,
        protocol_op: ProtocolOp::SearchResultEntry(SearchResultEntry {
            object_name: dn.to_string(),
            attributes: group_attributes(values),
        }),
    })
}

/// One SearchResultEntry for an enumerated object.
pub fn search_entry(message_id: i32, entry: &Entry) -> Result<Vec<u8>> {
    entry_message(message_id, &entry.dn, &entry.attributes)
}

/// The root entry is returned under the empty DN.
pub fn root_dse_entry(message_id: i32, values: &[AttributeValue]) -> Result<Vec<u8>> {
    entry_message(message_id, "", values)
}

/// Terminal SearchResultDone: success, or operationsError carrying the error text.
pub fn search_done(message_id: i32, outcome: Result<(), &anyhow::Error>) -> Result<Vec<u8>> {
    let (result_code, diagnostic_message) = match outcome {
        Ok(()) => (RESULT_SUCCESS, String::new()),
        Err(e) => (RESULT_OPERATIONS_ERROR, e.to_string()),
    };
    encode_ldap_message(&LdapMessage {
        message_id,
        protocol_op: ProtocolOp::SearchResultDone(SearchResultDone {
            result_code,
            matched_dn: String::new(),
            diagnostic_message,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::ldap_protocol::{BerReader, LDAP_TAG_SEARCH_RESULT_DONE, LDAP_TAG_SEARCH_RESULT_ENTRY};
    use crate::soap::AttributeData;

    /// Decode a SearchResultEntry back into (dn, [(type, values)]).
    fn decode_entry(data: &[u8]) -> (i32, String, Vec<(String, Vec<Vec<u8>>)>) {
        let mut reader = BerReader::new(data);
        reader.read_sequence().unwrap();
        let id = reader.read_integer().unwrap();
        let (tag, body) = reader.read_tlv().unwrap();
        assert_eq!(tag, LDAP_TAG_SEARCH_RESULT_ENTRY);
        let mut body = BerReader::new(body);
        let dn = body.read_string().unwrap();
        let (_, attrs) = body.read_tlv().unwrap();
        let mut attrs = BerReader::new(attrs);
        let mut out = Vec::new();
        while attrs.remaining() > 0 {
            let (_, attr) = attrs.read_tlv().unwrap();
            let mut attr = BerReader::new(attr);
            let name = attr.read_string().unwrap();
            let (_, vals) = attr.read_tlv().unwrap();
            let mut vals = BerReader::new(vals);
            let mut values = Vec::new();
            while vals.remaining() > 0 {
                values.push(vals.read_octet_string().unwrap());
            }
            out.push((name, values));
        }
        (id, dn, out)
    }

    fn decode_done(data: &[u8]) -> (i32, u8, String) {
        let mut reader = BerReader::new(data);
        reader.read_sequence().unwrap();
        let id = reader.read_integer().unwrap();
        let (tag, body) = reader.read_tlv().unwrap();
        assert_eq!(tag, LDAP_TAG_SEARCH_RESULT_DONE);
        let mut body = BerReader::new(body);
        let code = body.read_enumerated().unwrap();
        let _matched = body.read_string().unwrap();
        let message = body.read_string().unwrap();
        (id, code, message)
    }

    #[test]
    fn test_entry_groups_values_in_first_seen_order() {
        let entry = Entry {
            dn: "CN=g,DC=x".to_string(),
            attributes: vec![
                AttributeValue::text("member", "CN=1"),
                AttributeValue::text("distinguishedName", "CN=g,DC=x"),
                AttributeValue::text("member", "CN=2"),
                AttributeValue {
                    name: "objectSid".to_string(),
                    value: AttributeData::Binary(vec![1, 0, 0xFF]),
                },
                AttributeValue::text("member", "CN=1"),
            ],
        };
        let (id, dn, attrs) = decode_entry(&search_entry(9, &entry).unwrap());
        assert_eq!(id, 9);
        assert_eq!(dn, "CN=g,DC=x");
        assert_eq!(
            attrs,
            vec![
                ("member".to_string(), vec![b"CN=1".to_vec(), b"CN=2".to_vec(), b"CN=1".to_vec()]),
                ("distinguishedName".to_string(), vec![b"CN=g,DC=x".to_vec()]),
                ("objectSid".to_string(), vec![vec![1, 0, 0xFF]]),
            ]
        );
    }

    #[test]
    fn test_root_dse_has_empty_dn() {
        let values = vec![
            AttributeValue::text("supportedLDAPVersion", "3"),
            AttributeValue::text("supportedLDAPVersion", "2"),
        ];
        let (_, dn, attrs) = decode_entry(&root_dse_entry(1, &values).unwrap());
        assert_eq!(dn, "");
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs[0].1.len(), 2);
    }

    #[test]
    fn test_done_success_and_error() {
        let (id, code, message) = decode_done(&search_done(4, Ok(())).unwrap());
        assert_eq!((id, code, message.as_str()), (4, 0, ""));

        let err = anyhow::Error::from(GatewayError::UnsupportedScope(7));
        let (id, code, message) = decode_done(&search_done(5, Err(&err)).unwrap());
        assert_eq!(id, 5);
        assert_eq!(code, RESULT_OPERATIONS_ERROR as u8);
        assert_eq!(message, "'7' is an unknown scope identifier");
    }
}
