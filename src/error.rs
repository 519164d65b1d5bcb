use std::collections::BTreeMap;
use thiserror::Error;

/// Errors that end a single LDAP operation. Anything that ends a connection
/// travels as a plain `anyhow::Error` instead.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The backend answered with a SOAP fault.
    #[error("ADWS Encountered '{error_type}', {}", details_json(.details))]
    BackendFault {
        error_type: String,
        details: BTreeMap<String, String>,
        reason: String,
    },

    #[error("Unsupported filter operator: context tag {0}")]
    UnsupportedFilterOperator(u8),

    #[error("'{0}' is an unknown scope identifier")]
    UnsupportedScope(u8),

    #[error("Type: {xsi_type} has not been implemented. This is used for node {attribute}")]
    UnsupportedAttributeType { attribute: String, xsi_type: String },

    #[error("Malformed ADWS response: {0}")]
    MalformedResponse(String),

    #[error("ADWS transport error: {0}")]
    Transport(String),
}

impl GatewayError {
    pub fn fault(error_type: impl Into<String>, details: BTreeMap<String, String>, reason: impl Into<String>) -> Self {
        GatewayError::BackendFault {
            error_type: error_type.into(),
            details,
            reason: reason.into(),
        }
    }
}

fn details_json(details: &BTreeMap<String, String>) -> String {
    serde_json::to_string(details).unwrap_or_else(|_| "{}".to_string())
}
