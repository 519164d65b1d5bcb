use crate::adws_client::AdwsConnection;
use crate::filter;
use crate::ldap_protocol::{
    encode_ldap_message, BindAuthentication, BindRequest, BindResponse, LdapMessage, ProtocolOp,
    SearchRequest, SearchScope, RESULT_SUCCESS,
};
use crate::search_response;
use crate::soap::{Entry, PAGE_SIZE};
use rand::thread_rng;
use rand::Rng;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use anyhow::Result;

/// Attributes ADWS rejects on the aggregate schema query; stripped before enumeration.
const AGGREGATE_SCHEMA_DENIED: [&str; 6] = [
    "createtimestamp",
    "ldapsyntaxes",
    "matchingrules",
    "matchingruleuse",
    "ditstructurerules",
    "nameforms",
];

const AGGREGATE_SCHEMA_PREFIX: &str = "cn=aggregate,cn=schema,cn=configuration,dc=";

// NTLM CHALLENGE_MESSAGE negotiate flags
const NTLMSSP_NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const NTLMSSP_REQUEST_TARGET: u32 = 0x0000_0004;
const NTLMSSP_NEGOTIATE_NTLM: u32 = 0x0000_0200;
const NTLMSSP_NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
const NTLMSSP_NEGOTIATE_EXTENDED_SESSIONSECURITY: u32 = 0x0008_0000;
const NTLMSSP_NEGOTIATE_TARGET_INFO: u32 = 0x0080_0000;
const NTLMSSP_NEGOTIATE_VERSION: u32 = 0x0200_0000;
const NTLMSSP_NEGOTIATE_128: u32 = 0x2000_0000;
const NTLMSSP_NEGOTIATE_56: u32 = 0x8000_0000;

/// Where a search was routed and how it ended. Used for metrics; the client already has its SearchResultDone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchStatus {
    pub op: &'static str,
    pub entries: u64,
    pub failed: bool,
}

/// Answers bind and search for one Listener. Shared by all its sessions.
pub struct LdapHandler {
    connection: Arc<AdwsConnection>,
}

impl LdapHandler {
    pub fn new(connection: Arc<AdwsConnection>) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Arc<AdwsConnection> {
        &self.connection
    }

    /// Build the BindResponse. Every bind succeeds: the gateway authenticates to ADWS with its own credentials.
    pub fn handle_bind(&self, message_id: i32, bind: &BindRequest) -> Result<Vec<u8>> {
        info!("Handling bind request");
        let matched_dn = match &bind.authentication {
            BindAuthentication::Simple(_) => {
                debug!("Simple authentication for {}", bind.name);
                Vec::new()
            }
            BindAuthentication::NtlmPackageDiscovery => {
                debug!("NTLM-1 authentication");
                b"NTLM".to_vec()
            }
            BindAuthentication::NtlmNegotiate(_) => {
                debug!("NTLM-2 authentication");
                ntlm_challenge()
            }
            BindAuthentication::NtlmResponse(_) => {
                debug!("NTLM-3 authentication");
                Vec::new()
            }
            BindAuthentication::Sasl { mechanism, .. } => {
                error!("Unknown authentication type: SASL '{}'", mechanism);
                Vec::new()
            }
            BindAuthentication::Unknown(choice) => {
                error!("Unknown authentication type: '{}'", choice);
                Vec::new()
            }
        };
        encode_ldap_message(&LdapMessage {
            message_id,
            protocol_op: ProtocolOp::BindResponse(BindResponse {
                result_code: RESULT_SUCCESS,
                matched_dn,
                diagnostic_message: String::new(),
            }),
        })
    }

    /// Run one search and write its entries plus the terminal SearchResultDone to `out`.
    /// Backend and request errors end up in the SearchResultDone; only a failed write to the
    /// client is returned as an error.
    pub async fn handle_search<W>(&self, message_id: i32, request: &SearchRequest, out: &mut W) -> Result<SearchStatus>
    where
        W: AsyncWrite + Unpin + Send,
    {
        debug!("Handling Search request");
        let mut status = SearchStatus {
            op: "search",
            entries: 0,
            failed: false,
        };
        let outcome = self.run_search(message_id, request, out, &mut status).await;
        let done = match &outcome {
            Ok(()) => search_response::search_done(message_id, Ok(()))?,
            Err(SearchFailure::Client(e)) => return Err(anyhow::anyhow!("Failed to write search results: {}", e)),
            Err(SearchFailure::Operation(e)) => {
                error!("Search failed: {}", e);
                status.failed = true;
                search_response::search_done(message_id, Err(e))?
            }
        };
        out.write_all(&done).await?;
        out.flush().await?;
        Ok(status)
    }

    async fn run_search<W>(
        &self,
        message_id: i32,
        request: &SearchRequest,
        out: &mut W,
        status: &mut SearchStatus,
    ) -> Result<(), SearchFailure>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let scope = SearchScope::try_from(request.scope).map_err(|e| SearchFailure::Operation(e.into()))?;
        let filters = filter::decode_fragments(&request.filters).map_err(SearchFailure::Operation)?;
        let filter_text = filter::translate_fragments(&filters);
        let dn = request.base_object.as_str();
        let mut attributes: Vec<String> = request
            .attributes
            .iter()
            .filter(|a| a.as_str() != "+")
            .cloned()
            .collect();

        info!("Request DN = {}", dn);
        info!("Request filter = {}", filter_text);
        info!("Request properties = {}", attributes.join(","));
        info!("Request scopeIdentifier = {}, Scope: {}", request.scope, scope.as_adws_str());

        if is_root_dse_query(dn, &filter_text, scope) {
            status.op = "root_dse";
            let values = self.connection.get_root_dse().await.map_err(SearchFailure::Operation)?;
            let entry = search_response::root_dse_entry(message_id, &values).map_err(SearchFailure::Operation)?;
            out.write_all(&entry).await.map_err(|e| SearchFailure::Client(e.into()))?;
            status.entries = 1;
            return Ok(());
        }

        if is_aggregate_schema_query(dn, &filter_text, scope) {
            attributes.retain(|a| !AGGREGATE_SCHEMA_DENIED.iter().any(|d| d.eq_ignore_ascii_case(a)));
            debug!("Filtered request properties = {}", attributes.join(","));
        }

        let (tx, rx) = mpsc::channel::<Entry>(PAGE_SIZE as usize);
        let producer = async move {
            self.connection
                .enumerate(dn, &filter_text, &attributes, scope, &tx)
                .await
        };
        let consumer = async {
            let mut rx = rx;
            let mut written = 0u64;
            while let Some(entry) = rx.recv().await {
                info!("Result DN = {}", entry.dn);
                let bytes = search_response::search_entry(message_id, &entry)?;
                out.write_all(&bytes).await?;
                written += 1;
            }
            Ok::<u64, anyhow::Error>(written)
        };
        let (produced, consumed) = tokio::join!(producer, consumer);
        status.entries = consumed.map_err(SearchFailure::Client)?;
        produced.map_err(SearchFailure::Operation)?;
        Ok(())
    }
}

enum SearchFailure {
    /// Reported to the client in SearchResultDone.
    Operation(anyhow::Error),
    /// The client connection itself failed.
    Client(anyhow::Error),
}

fn is_root_dse_query(dn: &str, filter: &str, scope: SearchScope) -> bool {
    dn.is_empty() && filter.eq_ignore_ascii_case("(objectclass=*)") && scope == SearchScope::BaseObject
}

fn is_aggregate_schema_query(dn: &str, filter: &str, scope: SearchScope) -> bool {
    dn.to_ascii_lowercase().starts_with(AGGREGATE_SCHEMA_PREFIX)
        && filter.eq_ignore_ascii_case("(objectclass=subschema)")
        && scope == SearchScope::BaseObject
}

/// NTLM CHALLENGE_MESSAGE with a random server challenge, no target name and an
/// AV list holding only MsvAvEOL.
fn ntlm_challenge() -> Vec<u8> {
    const PAYLOAD_OFFSET: u32 = 56;
    let flags = NTLMSSP_NEGOTIATE_UNICODE
        | NTLMSSP_REQUEST_TARGET
        | NTLMSSP_NEGOTIATE_NTLM
        | NTLMSSP_NEGOTIATE_ALWAYS_SIGN
        | NTLMSSP_NEGOTIATE_EXTENDED_SESSIONSECURITY
        | NTLMSSP_NEGOTIATE_TARGET_INFO
        | NTLMSSP_NEGOTIATE_VERSION
        | NTLMSSP_NEGOTIATE_128
        | NTLMSSP_NEGOTIATE_56;
    let mut challenge = [0u8; 8];
    thread_rng().fill(&mut challenge);
    let target_info: [u8; 4] = [0, 0, 0, 0];

    let mut msg = Vec::with_capacity(PAYLOAD_OFFSET as usize + target_info.len());
    msg.extend_from_slice(b"NTLMSSP\0");
    msg.extend_from_slice(&2u32.to_le_bytes());
    // TargetNameFields: empty
    msg.extend_from_slice(&0u16.to_le_bytes());
    msg.extend_from_slice(&0u16.to_le_bytes());
    msg.extend_from_slice(&PAYLOAD_OFFSET.to_le_bytes());
    msg.extend_from_slice(&flags.to_le_bytes());
    msg.extend_from_slice(&challenge);
    msg.extend_from_slice(&[0u8; 8]);
    // TargetInfoFields
    msg.extend_from_slice(&(target_info.len() as u16).to_le_bytes());
    msg.extend_from_slice(&(target_info.len() as u16).to_le_bytes());
    msg.extend_from_slice(&PAYLOAD_OFFSET.to_le_bytes());
    // Version 6.1 build 7601, NTLM revision 15
    msg.extend_from_slice(&[6, 1, 0xB1, 0x1D, 0, 0, 0, 0x0F]);
    msg.extend_from_slice(&target_info);
    msg
}
