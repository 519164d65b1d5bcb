pub mod adws_client;
pub mod backend;
pub mod config;
pub mod dns;
pub mod error;
pub mod filter;
pub mod ldap_handler;
pub mod ldap_protocol;
pub mod metrics;
pub mod search_response;
pub mod server;
pub mod soap;

pub use config::Config;
pub use metrics::{Metrics, run_metrics_server};
pub use server::Listener;
