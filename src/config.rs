use serde::{Deserialize, Serialize};
use std::path::Path;
use std::fs;
use anyhow::{Result, bail};

/// Gateway configuration. Every field can come from the YAML file or the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Domain controller serving the LDAP instance.
    pub domain_controller: Option<String>,
    /// Global catalog server; no GC listener is started without it.
    pub global_catalog: Option<String>,
    pub adws_dc_port: u16,
    pub adws_gc_port: u16,
    pub ldap_port: u16,
    pub gc_port: u16,
    /// ADWS instance for the LDAP listener (e.g. "ldap:389").
    pub ldap_instance: String,
    pub gc_instance: String,
    pub dns_port: u16,
    pub dns_enabled: bool,
    pub exit_on_dns_start_error: bool,
    pub use_windows_auth: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub domain: Option<String>,
    pub console_log_level: String,
    /// Directory for the log file. Empty string disables file logging.
    pub log_directory: String,
    /// Optional HTTP listen address for metrics and health (e.g. "0.0.0.0:9090"). Endpoints: GET /metrics (Prometheus), GET /health (liveness), GET /ready (readiness).
    pub metrics_listen: Option<String>,
    /// PEM CA bundle for verifying the backend TLS certificate. When unset the certificate is not verified.
    pub backend_tls_ca_file: Option<String>,
}

/// Credentials presented to ADWS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
    pub domain: String,
}

/// Everything one Listener needs: where to listen and which backend to drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub listen_addr: String,
    pub server: String,
    pub port: u16,
    pub instance: String,
    pub use_windows_auth: bool,
    pub credential: Option<Credential>,
    pub tls_ca_file: Option<String>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Username, password and domain are all set or all unset.
    pub fn credential(&self) -> Result<Option<Credential>> {
        match (&self.username, &self.password, &self.domain) {
            (None, None, None) => Ok(None),
            (Some(username), Some(password), Some(domain)) => Ok(Some(Credential {
                username: username.clone(),
                password: password.clone(),
                domain: domain.clone(),
            })),
            _ => bail!("Username, Password and Domain all need to be used when one value is entered"),
        }
    }

    pub fn ldap_endpoint(&self) -> Result<EndpointConfig> {
        let server = match self.domain_controller.as_deref() {
            Some(dc) if !dc.trim().is_empty() => dc.to_string(),
            _ => bail!("domain_controller is required (--domaincontroller)"),
        };
        Ok(EndpointConfig {
            listen_addr: format!("0.0.0.0:{}", self.ldap_port),
            server,
            port: self.adws_dc_port,
            instance: self.ldap_instance.clone(),
            use_windows_auth: self.use_windows_auth,
            credential: self.credential()?,
            tls_ca_file: self.backend_tls_ca_file.clone(),
        })
    }

    /// None when no global catalog is configured.
    pub fn gc_endpoint(&self) -> Result<Option<EndpointConfig>> {
        let server = match self.global_catalog.as_deref() {
            Some(gc) if !gc.trim().is_empty() => gc.to_string(),
            _ => return Ok(None),
        };
        Ok(Some(EndpointConfig {
            listen_addr: format!("0.0.0.0:{}", self.gc_port),
            server,
            port: self.adws_gc_port,
            instance: self.gc_instance.clone(),
            use_windows_auth: self.use_windows_auth,
            credential: self.credential()?,
            tls_ca_file: self.backend_tls_ca_file.clone(),
        }))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain_controller: None,
            global_catalog: None,
            adws_dc_port: 9389,
            adws_gc_port: 9389,
            ldap_port: 389,
            gc_port: 3268,
            ldap_instance: "ldap:389".to_string(),
            gc_instance: "ldap:3268".to_string(),
            dns_port: 53,
            dns_enabled: true,
            exit_on_dns_start_error: true,
            use_windows_auth: false,
            username: None,
            password: None,
            domain: None,
            console_log_level: "INFO".to_string(),
            log_directory: ".".to_string(),
            metrics_listen: None,
            backend_tls_ca_file: None,
        }
    }
}
