//! Firewall configuration types and well-known chain names
//!
//! A [`FirewallConfiguration`] is the validated, typed form of the external
//! configuration surface (see [`crate::config`]). It is built once per run and
//! never mutated afterwards.
//!
//! # Example
//!
//! ```
//! use proxy_init::core::firewall::{FirewallConfiguration, RedirectMode};
//!
//! let config = FirewallConfiguration {
//!     mode: RedirectMode::RedirectListed,
//!     ports_to_redirect_inbound: vec![8080, 9090],
//!     proxy_uid: Some(2102),
//!     ..FirewallConfiguration::new(4143, 4140)
//! };
//! assert_eq!(config.mode.as_str(), "redirect-listed");
//! ```

use serde::{Deserialize, Serialize};

/// Custom chain holding the `OUTPUT`-side rules
pub const OUTPUT_CHAIN_NAME: &str = "PROXY_INIT_OUTPUT";

/// Custom chain holding the `PREROUTING`-side rules
pub const REDIRECT_CHAIN_NAME: &str = "PROXY_INIT_REDIRECT";

/// The only table this tool touches
pub const NAT_TABLE: &str = "nat";

/// Inbound redirection policy
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
pub enum RedirectMode {
    /// Every inbound TCP connection goes to the proxy
    #[default]
    #[strum(serialize = "redirect-all")]
    RedirectAll,
    /// Only the listed destination ports go to the proxy
    #[strum(serialize = "redirect-listed")]
    RedirectListed,
}

impl RedirectMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            RedirectMode::RedirectAll => "redirect-all",
            RedirectMode::RedirectListed => "redirect-listed",
        }
    }
}

/// Built-in hook chains of the NAT table this tool jumps from
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumIter, strum::AsRefStr,
)]
pub enum HookChain {
    /// Packets that just arrived at a network interface
    #[strum(serialize = "PREROUTING")]
    Prerouting,
    /// Locally generated packets
    #[strum(serialize = "OUTPUT")]
    Output,
}

impl HookChain {
    pub const fn as_str(self) -> &'static str {
        match self {
            HookChain::Prerouting => "PREROUTING",
            HookChain::Output => "OUTPUT",
        }
    }
}

/// How to configure a pod's NAT table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallConfiguration {
    pub mode: RedirectMode,
    /// Only consulted in [`RedirectMode::RedirectListed`]
    pub ports_to_redirect_inbound: Vec<u16>,
    pub inbound_ports_to_ignore: Vec<u16>,
    pub outbound_ports_to_ignore: Vec<u16>,
    pub proxy_inbound_port: u16,
    pub proxy_outgoing_port: u16,
    /// Traffic owned by this uid skips the outbound redirect
    pub proxy_uid: Option<u32>,
    pub simulate_only: bool,
    /// Network namespace to enter (a path such as `/proc/1234/ns/net`)
    pub net_ns: Option<String>,
    pub use_wait_flag: bool,
}

impl FirewallConfiguration {
    /// Creates a redirect-all configuration with no exemptions.
    pub fn new(proxy_inbound_port: u16, proxy_outgoing_port: u16) -> Self {
        Self {
            mode: RedirectMode::RedirectAll,
            ports_to_redirect_inbound: Vec::new(),
            inbound_ports_to_ignore: Vec::new(),
            outbound_ports_to_ignore: Vec::new(),
            proxy_inbound_port,
            proxy_outgoing_port,
            proxy_uid: None,
            simulate_only: false,
            net_ns: None,
            use_wait_flag: false,
        }
    }
}
