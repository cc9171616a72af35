//! External configuration surface
//!
//! [`RawFirewallConfiguration`] mirrors the document callers hand in (plain
//! integers, empty strings for "unset"); converting it into a
//! [`FirewallConfiguration`] validates every field.
//!
//! ```json
//! {
//!   "mode": "redirect-listed",
//!   "portsToRedirectInbound": [8080, 9090],
//!   "inboundPortsToIgnore": [4190, 4191],
//!   "outboundPortsToIgnore": [443],
//!   "proxyInboundPort": 4143,
//!   "proxyOutgoingPort": 4140,
//!   "proxyUID": 2102,
//!   "simulateOnly": false,
//!   "netNs": "/proc/4242/ns/net",
//!   "useWaitFlag": true
//! }
//! ```

use crate::core::error::{Error, Result};
use crate::core::firewall::{FirewallConfiguration, RedirectMode};
use crate::validators;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration as supplied from outside, before validation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawFirewallConfiguration {
    #[serde(default)]
    pub mode: RedirectMode,
    #[serde(default)]
    pub ports_to_redirect_inbound: Vec<i64>,
    #[serde(default)]
    pub inbound_ports_to_ignore: Vec<i64>,
    #[serde(default)]
    pub outbound_ports_to_ignore: Vec<i64>,
    pub proxy_inbound_port: i64,
    pub proxy_outgoing_port: i64,
    /// Zero or negative disables the uid exemption
    #[serde(default, rename = "proxyUID")]
    pub proxy_uid: i64,
    #[serde(default)]
    pub simulate_only: bool,
    /// Empty means the current namespace
    #[serde(default)]
    pub net_ns: String,
    #[serde(default)]
    pub use_wait_flag: bool,
}

impl TryFrom<RawFirewallConfiguration> for FirewallConfiguration {
    type Error = Error;

    fn try_from(raw: RawFirewallConfiguration) -> Result<Self> {
        let field = |name: &'static str| move |message: String| Error::validation(name, message);
        let port_list = validators::validate_port_list;

        Ok(FirewallConfiguration {
            mode: raw.mode,
            ports_to_redirect_inbound: port_list(&raw.ports_to_redirect_inbound)
                .map_err(field("portsToRedirectInbound"))?,
            inbound_ports_to_ignore: port_list(&raw.inbound_ports_to_ignore)
                .map_err(field("inboundPortsToIgnore"))?,
            outbound_ports_to_ignore: port_list(&raw.outbound_ports_to_ignore)
                .map_err(field("outboundPortsToIgnore"))?,
            proxy_inbound_port: validators::validate_proxy_port(raw.proxy_inbound_port)
                .map_err(field("proxyInboundPort"))?,
            proxy_outgoing_port: validators::validate_proxy_port(raw.proxy_outgoing_port)
                .map_err(field("proxyOutgoingPort"))?,
            proxy_uid: validators::validate_uid(raw.proxy_uid).map_err(field("proxyUID"))?,
            simulate_only: raw.simulate_only,
            net_ns: validators::validate_netns(&raw.net_ns).map_err(field("netNs"))?,
            use_wait_flag: raw.use_wait_flag,
        })
    }
}

/// Parses and validates a JSON configuration document.
///
/// # Errors
///
/// Returns `Err` if the document is not valid JSON for this schema (unknown
/// keys and unknown modes included) or a field fails validation.
pub fn parse_config(json: &str) -> Result<FirewallConfiguration> {
    let raw: RawFirewallConfiguration = serde_json::from_str(json)?;
    FirewallConfiguration::try_from(raw)
}

/// Loads a configuration document from disk.
///
/// # Errors
///
/// Returns `Err` if the file cannot be read or [`parse_config`] rejects it.
pub async fn load_config(path: &Path) -> Result<FirewallConfiguration> {
    let json = tokio::fs::read_to_string(path).await?;
    parse_config(&json)
}
