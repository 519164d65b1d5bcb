// ADWS client: root entry fetch and the Enumerate/Renew/Pull/Release cycle over cached channels

use crate::backend::{AdwsService, ChannelConnector, SoapChannel};
use crate::config::EndpointConfig;
use crate::error::GatewayError;
use crate::ldap_protocol::SearchScope;
use crate::metrics::Metrics;
use crate::soap::{self, AttributeValue, EnumerationContext, Entry};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use anyhow::Result;
use tracing::{debug, info, warn};

/// Renew when the context expires within this margin.
const RENEW_MARGIN_MINUTES: i64 = 5;
/// Lifetime requested on renewal.
const RENEW_EXTENSION_MINUTES: i64 = 25;

/// Root entry fields carrying the reserved reference GUID instead of real data.
const ROOT_DSE_EXCLUDED_FIELDS: [&str; 3] = [
    "container-hierarchy-parent",
    "objectReferenceProperty",
    "supportedSASLMechanisms",
];

/// Paged results, (+) and (@) attribute retrieval: advertised by ADWS but not served here.
const ROOT_DSE_EXCLUDED_CONTROLS: [&str; 3] = [
    "1.2.840.113556.1.4.319",
    "1.3.6.1.4.1.4203.1.5.1",
    "1.3.6.1.4.1.4203.1.5.2",
];

/// Backend connection of one Listener. Channels are built lazily and rebuilt once closed.
pub struct AdwsConnection {
    endpoint: Arc<EndpointConfig>,
    connector: Arc<dyn ChannelConnector>,
    resource: Mutex<Option<Arc<dyn SoapChannel>>>,
    enumeration: Mutex<Option<Arc<dyn SoapChannel>>>,
    metrics: Option<Arc<Metrics>>,
}

impl AdwsConnection {
    pub fn new(endpoint: Arc<EndpointConfig>, connector: Arc<dyn ChannelConnector>) -> Self {
        Self {
            endpoint,
            connector,
            resource: Mutex::new(None),
            enumeration: Mutex::new(None),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        &self.endpoint
    }

    /// Cached channel for `service`, replaced when missing or closed.
    pub async fn get_or_create_client(&self, service: AdwsService) -> Result<Arc<dyn SoapChannel>> {
        let slot = match service {
            AdwsService::Resource => &self.resource,
            AdwsService::Enumeration => &self.enumeration,
        };
        let mut guard = slot.lock().await;
        if let Some(channel) = guard.as_ref() {
            if !channel.is_closed() {
                return Ok(Arc::clone(channel));
            }
        }
        debug!("Constructing new {} client for {}", service.name(), self.endpoint.server);
        let channel = self.connector.connect(service).await?;
        *guard = Some(Arc::clone(&channel));
        Ok(channel)
    }

    /// Send one envelope and parse the reply, counting the call and any fault.
    async fn call<T>(
        &self,
        channel: &Arc<dyn SoapChannel>,
        action: &str,
        envelope: String,
        parse: fn(&str) -> Result<T>,
    ) -> Result<T> {
        let short = action.rsplit('/').next().unwrap_or(action);
        let result = match channel.request(action, envelope).await {
            Ok(xml) => parse(&xml),
            Err(e) => Err(e),
        };
        if let Some(metrics) = &self.metrics {
            let fault = matches!(
                result.as_ref().err().and_then(|e| e.downcast_ref::<GatewayError>()),
                Some(GatewayError::BackendFault { .. })
            );
            metrics.inc_backend_call(short, fault);
        }
        result
    }

    /// Fetch the root entry with a single Get.
    pub async fn get_root_dse(&self) -> Result<Vec<AttributeValue>> {
        debug!("Getting RootDSE from {}", self.endpoint.server);
        let channel = self.get_or_create_client(AdwsService::Resource).await?;
        let request = soap::get_request(channel.endpoint_uri(), &self.endpoint.instance);
        let items = self.call(&channel, soap::ACTION_GET, request, soap::parse_get_response).await?;
        Ok(filter_root_dse(items))
    }

    /// Run one search to completion, sending every entry to `entries` as its page arrives.
    /// Returns the number of entries sent. The enumeration context is released exactly once
    /// whenever one was obtained.
    pub async fn enumerate(
        &self,
        base_dn: &str,
        filter: &str,
        attributes: &[String],
        scope: SearchScope,
        entries: &mpsc::Sender<Entry>,
    ) -> Result<u64> {
        let mut attributes = attributes.to_vec();
        if !attributes.iter().any(|a| a.eq_ignore_ascii_case("distinguishedname")) {
            attributes.push("distinguishedname".to_string());
        }

        let channel = self.get_or_create_client(AdwsService::Enumeration).await?;
        let request = soap::enumerate_request(
            channel.endpoint_uri(),
            &self.endpoint.instance,
            filter,
            base_dn,
            scope.as_adws_str(),
            &attributes,
        );
        let mut context = self
            .call(&channel, soap::ACTION_ENUMERATE, request, soap::parse_enumerate_response)
            .await?;
        debug!("Enumerate returned context {} (expires {:?})", context.context, context.expires);

        let outcome = self.drain(&channel, &mut context, entries).await;

        info!("Releasing enumerateContext: {}", context.context);
        let release = soap::release_request(channel.endpoint_uri(), &self.endpoint.instance, &context.context);
        if let Err(e) = self
            .call(&channel, soap::ACTION_RELEASE, release, soap::parse_release_response)
            .await
        {
            warn!("Error releasing enumerateContext {}: {}", context.context, e);
        }

        outcome
    }

    async fn drain(
        &self,
        channel: &Arc<dyn SoapChannel>,
        context: &mut EnumerationContext,
        entries: &mpsc::Sender<Entry>,
    ) -> Result<u64> {
        let mut sent = 0u64;
        let mut page_number = 0u64;
        loop {
            if entries.is_closed() {
                return Err(GatewayError::Transport("Search result receiver closed".to_string()).into());
            }
            if needs_renewal(context.expires, Utc::now()) {
                info!("Renewing expiration for {}", context.context);
                let expires = Utc::now() + ChronoDuration::minutes(RENEW_EXTENSION_MINUTES);
                let request = soap::renew_request(channel.endpoint_uri(), &self.endpoint.instance, &context.context, expires);
                let renewed = self
                    .call(channel, soap::ACTION_RENEW, request, soap::parse_renew_response)
                    .await?;
                debug!(
                    "Renewed context {} (expires {:?}) as {} (expires {:?})",
                    context.context, context.expires, renewed.context, renewed.expires
                );
                *context = renewed;
            }

            let request = soap::pull_request(channel.endpoint_uri(), &self.endpoint.instance, &context.context);
            let page = self
                .call(channel, soap::ACTION_PULL, request, soap::parse_pull_response)
                .await?;
            if let Some(next) = page.context {
                context.context = next;
            }
            for entry in page.entries {
                entries
                    .send(entry)
                    .await
                    .map_err(|_| GatewayError::Transport("Search result receiver closed".to_string()))?;
                sent += 1;
            }
            info!("Completed page {} for enumerateContext {}", page_number, context.context);
            page_number += 1;
            if page.end_of_sequence {
                return Ok(sent);
            }
        }
    }

    /// Close both cached channels.
    pub async fn close(&self) {
        for slot in [&self.resource, &self.enumeration] {
            if let Some(channel) = slot.lock().await.take() {
                channel.close().await;
            }
        }
    }
}

fn needs_renewal(expires: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match expires {
        Some(expires) => expires - ChronoDuration::minutes(RENEW_MARGIN_MINUTES) < now,
        None => false,
    }
}

/// Flatten Get items into attribute values, dropping the excluded fields and controls.
fn filter_root_dse(items: Vec<(String, Vec<String>)>) -> Vec<AttributeValue> {
    let mut result = Vec::new();
    for (name, values) in items {
        if ROOT_DSE_EXCLUDED_FIELDS.iter().any(|f| f.eq_ignore_ascii_case(&name)) {
            continue;
        }
        let is_control_list = name.eq_ignore_ascii_case("supportedControl");
        for value in values {
            if is_control_list && ROOT_DSE_EXCLUDED_CONTROLS.contains(&value.as_str()) {
                continue;
            }
            result.push(AttributeValue::text(name.clone(), value));
        }
    }
    result
}
