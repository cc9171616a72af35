//! proxy-init - Sidecar proxy traffic redirection
//!
//! Configures a pod's iptables NAT table so inbound and outbound TCP traffic
//! is transparently redirected through a local proxy.
//!
//! # Architecture
//!
//! - [`core`] - Rule generation, ordering, and execution against iptables
//! - [`config`] - External configuration surface and validation
//! - [`namespace`] - Network namespace entry via `nsenter`
//! - [`audit`] - JSON-lines audit records of each run
//! - [`validators`] - Input validation and sanitization
//!
//! # Example
//!
//! ```no_run
//! use proxy_init::core::diagnostics::TraceId;
//! use proxy_init::core::driver::{ProcessRunner, Tools, configure_firewall};
//! use proxy_init::FirewallConfiguration;
//!
//! # async fn example() -> proxy_init::Result<()> {
//! let config = FirewallConfiguration {
//!     proxy_uid: Some(2102),
//!     inbound_ports_to_ignore: vec![4190, 4191],
//!     ..FirewallConfiguration::new(4143, 4140)
//! };
//! let report =
//!     configure_firewall(&config, &Tools::default(), TraceId::generate(), ProcessRunner).await?;
//! println!("applied {} rules", report.transaction.install.len());
//! # Ok(())
//! # }
//! ```

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod namespace;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::firewall::{FirewallConfiguration, RedirectMode};
