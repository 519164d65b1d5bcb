use anyhow::{Context, Result};
use clap::Parser;
use ldap_adws_gateway::backend::NmfConnector;
use ldap_adws_gateway::config::EndpointConfig;
use ldap_adws_gateway::dns::{self, DnsResponder};
use ldap_adws_gateway::soap::{AttributeData, AttributeValue};
use ldap_adws_gateway::{run_metrics_server, Config, Listener, Metrics};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_FILE_NAME: &str = "ldap-adws-gateway.log";

#[derive(Parser)]
#[command(name = "ldap-adws-gateway")]
#[command(about = "LDAP v3 gateway - answers LDAP binds and searches from Active Directory Web Services")]
struct Args {
    /// YAML configuration file; command line flags override its values
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// The domain controller to proxy to
    #[arg(long = "domaincontroller")]
    domain_controller: Option<String>,

    /// The global catalog to proxy to
    #[arg(long = "globalcatalog")]
    global_catalog: Option<String>,

    /// The ADWS port to proxy to on the domain controller [default: 9389]
    #[arg(long = "adwsdcport")]
    adws_dc_port: Option<u16>,

    /// The ADWS port to proxy to on the global catalog [default: 9389]
    #[arg(long = "adwsgcport")]
    adws_gc_port: Option<u16>,

    /// The LDAP port to proxy from [default: 389]
    #[arg(long = "ldapport")]
    ldap_port: Option<u16>,

    /// The GC port to proxy from [default: 3268]
    #[arg(long = "gcport")]
    gc_port: Option<u16>,

    /// The LDAP instance within ADWS [default: ldap:389]
    #[arg(long = "ldapinstance")]
    ldap_instance: Option<String>,

    /// The GC instance within ADWS [default: ldap:3268]
    #[arg(long = "gcinstance")]
    gc_instance: Option<String>,

    /// The DNS port to answer on [default: 53]
    #[arg(long = "dnsport")]
    dns_port: Option<u16>,

    /// Do not start the DNS responder
    #[arg(long)]
    no_dns: bool,

    /// Exit if the DNS port cannot be bound [default: true]
    #[arg(long = "exitondnsstarterror")]
    exit_on_dns_start_error: Option<bool>,

    /// Use Windows authentication instead of username/password over TLS [default: false]
    #[arg(long = "usewindowsauth")]
    use_windows_auth: Option<bool>,

    /// The username to authenticate to ADWS
    #[arg(short, long)]
    username: Option<String>,

    /// The password to authenticate to ADWS
    #[arg(short, long)]
    password: Option<String>,

    /// The domain to authenticate to ADWS
    #[arg(short = 'D', long)]
    domain: Option<String>,

    /// Console log level (ALL, DEBUG, INFO, WARN, ERROR, FATAL, OFF) [default: INFO]
    #[arg(long = "consoleloglevel")]
    console_log_level: Option<String>,

    /// Directory for the log file; empty disables file logging [default: .]
    #[arg(long = "logdirectory")]
    log_directory: Option<String>,

    /// HTTP address for /metrics, /health and /ready (e.g. 0.0.0.0:9090)
    #[arg(long, value_name = "ADDR")]
    metrics_listen: Option<String>,

    /// PEM CA bundle used to verify the ADWS certificate
    #[arg(long, value_name = "FILE")]
    backend_tls_ca: Option<String>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if self.domain_controller.is_some() {
            config.domain_controller = self.domain_controller;
        }
        if self.global_catalog.is_some() {
            config.global_catalog = self.global_catalog;
        }
        if let Some(v) = self.adws_dc_port {
            config.adws_dc_port = v;
        }
        if let Some(v) = self.adws_gc_port {
            config.adws_gc_port = v;
        }
        if let Some(v) = self.ldap_port {
            config.ldap_port = v;
        }
        if let Some(v) = self.gc_port {
            config.gc_port = v;
        }
        if let Some(v) = self.ldap_instance {
            config.ldap_instance = v;
        }
        if let Some(v) = self.gc_instance {
            config.gc_instance = v;
        }
        if let Some(v) = self.dns_port {
            config.dns_port = v;
        }
        if self.no_dns {
            config.dns_enabled = false;
        }
        if let Some(v) = self.exit_on_dns_start_error {
            config.exit_on_dns_start_error = v;
        }
        if let Some(v) = self.use_windows_auth {
            config.use_windows_auth = v;
        }
        if self.username.is_some() {
            config.username = self.username;
        }
        if self.password.is_some() {
            config.password = self.password;
        }
        if self.domain.is_some() {
            config.domain = self.domain;
        }
        if let Some(v) = self.console_log_level {
            config.console_log_level = v;
        }
        if let Some(v) = self.log_directory {
            config.log_directory = v;
        }
        if self.metrics_listen.is_some() {
            config.metrics_listen = self.metrics_listen;
        }
        if self.backend_tls_ca.is_some() {
            config.backend_tls_ca_file = self.backend_tls_ca;
        }
    }
}

/// Map a console level name onto an EnvFilter directive.
fn console_directive(level: &str) -> String {
    let level = match level.trim().to_ascii_lowercase().as_str() {
        "all" | "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" | "fatal" => "error",
        "off" => return "off".to_string(),
        _ => "info",
    };
    format!("ldap_adws_gateway={},info", level)
}

fn init_logging(level: &str, log_directory: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(console_directive(level)))
        .context("Invalid log filter")?;

    let file_layer = if log_directory.is_empty() {
        None
    } else {
        std::fs::create_dir_all(log_directory)
            .with_context(|| format!("Failed to create log directory {}", log_directory))?;
        let path = Path::new(log_directory).join(LOG_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file {:?}", path))?;
        Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init()
        .context("Failed to install log subscriber")?;
    Ok(())
}

fn build_listener(endpoint: EndpointConfig, metrics: &Arc<Metrics>) -> Result<Arc<Listener>> {
    let connector = NmfConnector::new(endpoint.clone())?;
    Ok(Arc::new(Listener::new(endpoint, Arc::new(connector), Arc::clone(metrics))))
}

fn describe_attributes(values: &[AttributeValue]) -> String {
    values
        .iter()
        .map(|v| match &v.value {
            AttributeData::Text(s) => format!("{}={}", v.name, s),
            AttributeData::Binary(b) => format!("{}=<{} bytes>", v.name, b.len()),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

async fn check_root_dse(name: &str, listener: &Listener) {
    match listener.connection().get_root_dse().await {
        Ok(values) => {
            info!("Successfully got RootDSE via {} listener", name);
            debug!("{} RootDSE: {}", name, describe_attributes(&values));
        }
        Err(e) => error!("RootDSE check via {} listener failed: {:#}", name, e),
    }
}

async fn start_dns(config: &Config) -> Result<()> {
    let socket = match dns::bind(config.dns_port).await {
        Ok(socket) => socket,
        Err(e) => {
            error!("{:#}", e);
            if config.exit_on_dns_start_error {
                return Err(e);
            }
            return Ok(());
        }
    };
    match DnsResponder::for_local_host(config.ldap_port, config.gc_port).await {
        Ok(responder) => {
            info!(
                "Successfully started the DNS responder on UDP/{} ({} -> {})",
                config.dns_port,
                responder.hostname(),
                responder.address()
            );
            tokio::spawn(async move {
                if let Err(e) = Arc::new(responder).serve(socket).await {
                    error!("DNS responder error: {:#}", e);
                }
            });
        }
        Err(e) => error!("Error starting DNS responder: {:#}", e),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match args.config.as_ref() {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path))?,
        None => Config::default(),
    };
    args.apply(&mut config);

    init_logging(&config.console_log_level, &config.log_directory)?;
    info!("Starting LDAP ADWS gateway");

    let metrics = Arc::new(Metrics::new());
    if let Some(addr) = config.metrics_listen.clone() {
        let metrics_for_http = Arc::clone(&metrics);
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&addr, metrics_for_http).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let mut tasks = JoinSet::new();

    let ldap = build_listener(config.ldap_endpoint()?, &metrics)?;
    let socket = ldap.bind().await?;
    info!("Successfully started the LDAP listener using instance {}", ldap.instance());
    {
        let ldap = Arc::clone(&ldap);
        tasks.spawn(async move { ldap.serve(socket).await });
    }

    let gc = match config.gc_endpoint()? {
        Some(endpoint) => {
            let gc = build_listener(endpoint, &metrics)?;
            let socket = gc.bind().await?;
            info!("Successfully started the GC listener using instance {}", gc.instance());
            let serving = Arc::clone(&gc);
            tasks.spawn(async move { serving.serve(socket).await });
            Some(gc)
        }
        None => {
            info!("No Global Catalog server defined so no Global Catalog listener has been started");
            None
        }
    };

    if config.dns_enabled {
        start_dns(&config).await?;
    }

    check_root_dse("LDAP", &ldap).await;
    if let Some(gc) = gc.as_ref() {
        check_root_dse("GC", gc).await;
    }

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            Ok(())
        }
        Some(joined) = tasks.join_next() => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("Application will close because of an error: {:#}", e);
                Err(e)
            }
            Err(e) => Err(anyhow::anyhow!("Listener task failed: {}", e)),
        },
    };

    tasks.abort_all();
    ldap.connection().close().await;
    if let Some(gc) = gc {
        gc.connection().close().await;
    }
    outcome
}
