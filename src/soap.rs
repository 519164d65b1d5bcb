// SOAP 1.2 / WS-Transfer / WS-Enumeration message codec for Active Directory Web Services

use anyhow::Result;
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::collections::BTreeMap;
use tracing::warn;

use crate::error::GatewayError;

pub const NS_SOAP: &str = "http://www.w3.org/2003/05/soap-envelope";
pub const NS_ADDRESSING: &str = "http://www.w3.org/2005/08/addressing";
pub const NS_AD: &str = "http://schemas.microsoft.com/2008/1/ActiveDirectory";
pub const NS_AD_DATA: &str = "http://schemas.microsoft.com/2008/1/ActiveDirectory/Data";
pub const NS_ENUMERATION: &str = "http://schemas.xmlsoap.org/ws/2004/09/enumeration";
pub const NS_LDAP_QUERY: &str = "http://schemas.microsoft.com/2008/1/ActiveDirectory/Dialect/LdapQuery";
pub const NS_XPATH_DIALECT: &str = "http://schemas.microsoft.com/2008/1/ActiveDirectory/Dialect/XPath-Level-1";
pub const NS_XSD: &str = "http://www.w3.org/2001/XMLSchema";
pub const NS_XSI: &str = "http://www.w3.org/2001/XMLSchema-instance";
const NS_WSSE: &str = "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";
const PASSWORD_TEXT: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordText";
const ANONYMOUS: &str = "http://www.w3.org/2005/08/addressing/anonymous";

pub const ACTION_GET: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Get";
pub const ACTION_ENUMERATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/enumeration/Enumerate";
pub const ACTION_PULL: &str = "http://schemas.xmlsoap.org/ws/2004/09/enumeration/Pull";
pub const ACTION_RENEW: &str = "http://schemas.xmlsoap.org/ws/2004/09/enumeration/Renew";
pub const ACTION_RELEASE: &str = "http://schemas.xmlsoap.org/ws/2004/09/enumeration/Release";

/// Object reference the backend reserves for the root entry.
pub const ROOT_DSE_REFERENCE: &str = "11111111-1111-1111-1111-111111111111";

/// Entries requested per Pull.
pub const PAGE_SIZE: u32 = 256;

/// LDAP_SERVER_SD_FLAGS_OID with OWNER|GROUP|DACL so security descriptors come back readable.
const SD_FLAGS_CONTROL: &str = "1.2.840.113556.1.4.801";
const SD_FLAGS_VALUE: [u8; 9] = [0x30, 0x84, 0x00, 0x00, 0x00, 0x03, 0x02, 0x01, 0x07];

/// One attribute value as returned by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeData {
    Text(String),
    Binary(Vec<u8>),
}

impl AttributeData {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            AttributeData::Text(s) => s.as_bytes(),
            AttributeData::Binary(b) => b,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeValue {
    pub name: String,
    pub value: AttributeData,
}

impl AttributeValue {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: AttributeData::Text(value.into()),
        }
    }
}

/// A directory object from one Pull page, values in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub dn: String,
    pub attributes: Vec<AttributeValue>,
}

/// Enumeration context handed out by Enumerate and Renew.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumerationContext {
    pub context: String,
    pub expires: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullPage {
    pub context: Option<String>,
    pub end_of_sequence: bool,
    pub entries: Vec<Entry>,
}

// ---------------------------------------------------------------------------
// Request builders
// ---------------------------------------------------------------------------

fn envelope(action: &str, to: &str, instance: &str, extra_headers: &str, body: &str) -> String {
    format!(
        concat!(
            r#"<s:Envelope xmlns:s="{ns_s}" xmlns:wsa="{ns_wsa}" xmlns:ad="{ns_ad}" xmlns:addata="{ns_addata}" "#,
            r#"xmlns:xsd="{ns_xsd}" xmlns:xsi="{ns_xsi}">"#,
            r#"<s:Header>"#,
            r#"<wsa:Action s:mustUnderstand="1">{action}</wsa:Action>"#,
            r#"<ad:instance>{instance}</ad:instance>"#,
            r#"{extra}"#,
            r#"<wsa:MessageID>urn:uuid:{id}</wsa:MessageID>"#,
            r#"<wsa:ReplyTo><wsa:Address>{anon}</wsa:Address></wsa:ReplyTo>"#,
            r#"<wsa:To s:mustUnderstand="1">{to}</wsa:To>"#,
            r#"</s:Header>"#,
            r#"<s:Body>{body}</s:Body>"#,
            r#"</s:Envelope>"#
        ),
        ns_s = NS_SOAP,
        ns_wsa = NS_ADDRESSING,
        ns_ad = NS_AD,
        ns_addata = NS_AD_DATA,
        ns_xsd = NS_XSD,
        ns_xsi = NS_XSI,
        action = action,
        instance = escape(instance),
        extra = extra_headers,
        id = uuid::Uuid::new_v4(),
        anon = ANONYMOUS,
        to = escape(to),
        body = body,
    )
}

/// WS-Transfer Get for the root entry.
pub fn get_request(to: &str, instance: &str) -> String {
    let reference = format!("<ad:objectReferenceProperty>{}</ad:objectReferenceProperty>", ROOT_DSE_REFERENCE);
    envelope(ACTION_GET, to, instance, &reference, "")
}

/// Selection token for one requested attribute.
pub fn selection_property(attribute: &str) -> String {
    if attribute.eq_ignore_ascii_case("distinguishedname") {
        "ad:distinguishedName".to_string()
    } else if attribute == "*" {
        "ad:all".to_string()
    } else if attribute == "**" {
        "addata:all".to_string()
    } else {
        format!("addata:{}", attribute)
    }
}

pub fn enumerate_request(
    to: &str,
    instance: &str,
    filter: &str,
    base_dn: &str,
    scope: &str,
    attributes: &[String],
) -> String {
    let mut body = format!(
        concat!(
            r#"<wsen:Enumerate xmlns:wsen="{wsen}" xmlns:adlq="{adlq}">"#,
            r#"<wsen:Filter Dialect="{adlq}">"#,
            r#"<adlq:LdapQuery>"#,
            r#"<adlq:Filter>{filter}</adlq:Filter>"#,
            r#"<adlq:BaseObject>{base}</adlq:BaseObject>"#,
            r#"<adlq:Scope>{scope}</adlq:Scope>"#,
            r#"</adlq:LdapQuery>"#,
            r#"</wsen:Filter>"#
        ),
        wsen = NS_ENUMERATION,
        adlq = NS_LDAP_QUERY,
        filter = escape(filter),
        base = escape(base_dn),
        scope = escape(scope),
    );
    if !attributes.is_empty() {
        body.push_str(&format!(r#"<ad:Selection Dialect="{}">"#, NS_XPATH_DIALECT));
        for attribute in attributes {
            body.push_str("<ad:SelectionProperty>");
            body.push_str(&escape(&selection_property(attribute)));
            body.push_str("</ad:SelectionProperty>");
        }
        body.push_str("</ad:Selection>");
    }
    body.push_str("</wsen:Enumerate>");
    envelope(ACTION_ENUMERATE, to, instance, "", &body)
}

pub fn pull_request(to: &str, instance: &str, context: &str) -> String {
    let body = format!(
        concat!(
            r#"<wsen:Pull xmlns:wsen="{wsen}">"#,
            r#"<wsen:EnumerationContext>{context}</wsen:EnumerationContext>"#,
            r#"<wsen:MaxElements>{max}</wsen:MaxElements>"#,
            r#"<ad:controls>"#,
            r#"<ad:control type="{oid}" criticality="true">"#,
            r#"<ad:controlValue xsi:type="xsd:base64Binary">{value}</ad:controlValue>"#,
            r#"</ad:control>"#,
            r#"</ad:controls>"#,
            r#"</wsen:Pull>"#
        ),
        wsen = NS_ENUMERATION,
        context = escape(context),
        max = PAGE_SIZE,
        oid = SD_FLAGS_CONTROL,
        value = STANDARD.encode(SD_FLAGS_VALUE),
    );
    envelope(ACTION_PULL, to, instance, "", &body)
}

pub fn renew_request(to: &str, instance: &str, context: &str, expires: DateTime<Utc>) -> String {
    let body = format!(
        concat!(
            r#"<wsen:Renew xmlns:wsen="{wsen}">"#,
            r#"<wsen:EnumerationContext>{context}</wsen:EnumerationContext>"#,
            r#"<wsen:Expires>{expires}</wsen:Expires>"#,
            r#"</wsen:Renew>"#
        ),
        wsen = NS_ENUMERATION,
        context = escape(context),
        expires = expires.to_rfc3339_opts(SecondsFormat::Millis, true),
    );
    envelope(ACTION_RENEW, to, instance, "", &body)
}

pub fn release_request(to: &str, instance: &str, context: &str) -> String {
    let body = format!(
        r#"<wsen:Release xmlns:wsen="{}"><wsen:EnumerationContext>{}</wsen:EnumerationContext></wsen:Release>"#,
        NS_ENUMERATION,
        escape(context),
    );
    envelope(ACTION_RELEASE, to, instance, "", &body)
}

/// WS-Security UsernameToken header for UserName-mode endpoints.
pub fn security_header(username: &str, password: &str) -> String {
    format!(
        concat!(
            r#"<o:Security s:mustUnderstand="1" xmlns:o="{wsse}">"#,
            r#"<o:UsernameToken u:Id="uuid-{id}-1" "#,
            r#"xmlns:u="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd">"#,
            r#"<o:Username>{user}</o:Username>"#,
            r#"<o:Password Type="{ptype}">{password}</o:Password>"#,
            r#"</o:UsernameToken>"#,
            r#"</o:Security>"#
        ),
        wsse = NS_WSSE,
        id = uuid::Uuid::new_v4(),
        user = escape(username),
        ptype = PASSWORD_TEXT,
        password = escape(password),
    )
}

/// Insert an extra header block into a built envelope.
pub fn with_header(envelope: &str, header: &str) -> String {
    envelope.replacen("<s:Header>", &format!("<s:Header>{}", header), 1)
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    text: String,
    children: Vec<Element>,
}

impl Element {
    fn from_start(e: &BytesStart<'_>) -> Self {
        let name = String::from_utf8_lossy(e.local_name().into_inner()).to_string();
        let attributes = e
            .attributes()
            .flatten()
            .map(|attr| {
                let key = String::from_utf8_lossy(attr.key.local_name().into_inner()).to_string();
                let value = attr
                    .unescape_value()
                    .map(|v| v.to_string())
                    .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).to_string());
                (key, value)
            })
            .collect();
        Element {
            name,
            attributes,
            ..Default::default()
        }
    }

    fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

fn parse_tree(xml: &str) -> Result<Element, GatewayError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    let mut root = None;
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => stack.push(Element::from_start(e)),
            Ok(Event::Empty(ref e)) => {
                let element = Element::from_start(e);
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            }
            Ok(Event::Text(ref e)) => {
                let text = e
                    .unescape()
                    .map_err(|e| GatewayError::MalformedResponse(format!("XML text: {e}")))?;
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&text);
                }
            }
            Ok(Event::CData(ref e)) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(e));
                }
            }
            Ok(Event::End(_)) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| GatewayError::MalformedResponse("Unbalanced end tag".to_string()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(GatewayError::MalformedResponse(format!("XML parse error: {e}"))),
            _ => {}
        }
        buf.clear();
    }
    if !stack.is_empty() {
        return Err(GatewayError::MalformedResponse("Unexpected end of document".to_string()));
    }
    root.ok_or_else(|| GatewayError::MalformedResponse("Empty document".to_string()))
}

/// Parse an envelope and return its Body, or the decoded fault.
fn parse_body(xml: &str) -> Result<Element, GatewayError> {
    let root = match parse_tree(xml) {
        Ok(root) => root,
        Err(e) => {
            if xml.contains(":Fault") || xml.contains("<Fault") {
                warn!("Unreadable SOAP fault: {}", e);
                return Err(GatewayError::fault("", BTreeMap::new(), ""));
            }
            return Err(e);
        }
    };
    if !root.name.eq_ignore_ascii_case("Envelope") {
        return Err(GatewayError::MalformedResponse(format!("Expected Envelope, got {}", root.name)));
    }
    let body = root
        .children
        .into_iter()
        .find(|c| c.name.eq_ignore_ascii_case("Body"))
        .ok_or_else(|| GatewayError::MalformedResponse("Envelope has no Body".to_string()))?;
    if let Some(fault) = body.child("Fault") {
        return Err(decode_fault(fault));
    }
    Ok(body)
}

/// Fault → BackendFault. Never fails: a missing or odd detail just leaves the map empty.
fn decode_fault(fault: &Element) -> GatewayError {
    let reason = fault
        .child("Reason")
        .map(|r| r.child("Text").map(|t| t.text.clone()).unwrap_or_else(|| r.text.clone()))
        .or_else(|| fault.child("faultstring").map(|f| f.text.clone()))
        .unwrap_or_default();

    let mut error_type = String::new();
    let mut details = BTreeMap::new();
    if let Some(detail) = fault.child("Detail") {
        if let Some(fault_detail) = detail.child("FaultDetail") {
            if let Some(kind) = fault_detail.children.first() {
                error_type = kind.name.clone();
                for child in &kind.children {
                    collect_details(child, &mut details);
                }
            }
        }
    }
    GatewayError::fault(error_type, details, reason)
}

fn collect_details(element: &Element, details: &mut BTreeMap<String, String>) {
    if element.name != "value" {
        let text = if !element.text.is_empty() {
            Some(element.text.clone())
        } else {
            element.child("value").map(|v| v.text.clone()).filter(|t| !t.is_empty())
        };
        if let Some(text) = text {
            details.insert(element.name.clone(), text);
        }
    }
    for child in &element.children {
        collect_details(child, details);
    }
}

fn parse_expires(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    warn!("Ignoring unparseable enumeration expiry '{}'", text);
    None
}

fn parse_context_response(body: &Element, wrapper: &str) -> Result<EnumerationContext, GatewayError> {
    let response = body
        .child(wrapper)
        .ok_or_else(|| GatewayError::MalformedResponse(format!("Body has no {}", wrapper)))?;
    let context = response
        .child("EnumerationContext")
        .map(|c| c.text.clone())
        .ok_or_else(|| GatewayError::MalformedResponse(format!("{} has no EnumerationContext", wrapper)))?;
    let expires = response.child("Expires").and_then(|e| parse_expires(&e.text));
    Ok(EnumerationContext { context, expires })
}

pub fn parse_enumerate_response(xml: &str) -> Result<EnumerationContext> {
    let body = parse_body(xml)?;
    Ok(parse_context_response(&body, "EnumerateResponse")?)
}

pub fn parse_renew_response(xml: &str) -> Result<EnumerationContext> {
    let body = parse_body(xml)?;
    Ok(parse_context_response(&body, "RenewResponse")?)
}

pub fn parse_release_response(xml: &str) -> Result<()> {
    parse_body(xml)?;
    Ok(())
}

pub fn parse_pull_response(xml: &str) -> Result<PullPage> {
    let body = parse_body(xml)?;
    let response = body
        .child("PullResponse")
        .ok_or_else(|| GatewayError::MalformedResponse("Body has no PullResponse".to_string()))?;

    let mut page = PullPage {
        context: response.child("EnumerationContext").map(|c| c.text.clone()),
        end_of_sequence: response.child("EndOfSequence").is_some(),
        entries: Vec::new(),
    };
    if let Some(items) = response.child("Items") {
        for object in &items.children {
            if let Some(entry) = parse_object(object)? {
                page.entries.push(entry);
            }
        }
    }
    Ok(page)
}

/// One `addata:<class>` item. Objects without a distinguishedName are skipped.
fn parse_object(object: &Element) -> Result<Option<Entry>, GatewayError> {
    let mut dn = None;
    let mut attributes = Vec::new();
    for property in &object.children {
        if property.name.eq_ignore_ascii_case("distinguishedName") {
            let value = property
                .child("value")
                .map(|v| v.text.clone())
                .unwrap_or_else(|| property.text.clone());
            attributes.push(AttributeValue::text("distinguishedName", value.clone()));
            dn = Some(value);
            continue;
        }
        for value in property.children.iter().filter(|v| v.name == "value") {
            let xsi_type = value.attribute("type").unwrap_or_default();
            let data = match xsi_type.rsplit(':').next().unwrap_or_default() {
                "string" => AttributeData::Text(value.text.clone()),
                "base64Binary" => AttributeData::Binary(STANDARD.decode(value.text.as_bytes()).map_err(|e| {
                    GatewayError::MalformedResponse(format!("Bad base64 in {}: {}", property.name, e))
                })?),
                _ => {
                    return Err(GatewayError::UnsupportedAttributeType {
                        attribute: property.name.clone(),
                        xsi_type: xsi_type.to_string(),
                    });
                }
            };
            attributes.push(AttributeValue {
                name: property.name.clone(),
                value: data,
            });
        }
    }
    Ok(dn.filter(|d| !d.is_empty()).map(|dn| Entry { dn, attributes }))
}

/// Flatten a Get response into (name, values) in document order.
pub fn parse_get_response(xml: &str) -> Result<Vec<(String, Vec<String>)>> {
    let body = parse_body(xml)?;
    let mut items: Vec<(String, Vec<String>)> = Vec::new();
    for child in &body.children {
        flatten_get(child, &mut items);
    }
    Ok(items)
}

fn flatten_get(element: &Element, items: &mut Vec<(String, Vec<String>)>) {
    if element.name != "value" {
        let mut values: Vec<String> = element
            .children
            .iter()
            .filter(|c| c.name == "value" && !c.text.is_empty())
            .map(|c| c.text.clone())
            .collect();
        if !element.text.is_empty() {
            values.insert(0, element.text.clone());
        }
        if !values.is_empty() {
            match items.iter_mut().find(|(name, _)| *name == element.name) {
                Some((_, existing)) => existing.extend(values),
                None => items.push((element.name.clone(), values)),
            }
        }
    }
    for child in element.children.iter().filter(|c| c.name != "value") {
        flatten_get(child, items);
    }
}
