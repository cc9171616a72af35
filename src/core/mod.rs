//! Core rule generation and execution
//!
//! This module contains the types and logic that turn a configuration into
//! iptables NAT rules and apply them. It provides:
//!
//! - [`firewall`]: Configuration types and well-known chain names
//! - [`rules`]: Rule primitives, one [`rules::RuleMutation`] per iptables command
//! - [`compose`]: Ordering of cleanup, inbound and outbound rules
//! - [`driver`]: Dispatch of mutations with best-effort and fail-fast policies
//! - [`diagnostics`]: Execution trace ids and rule table snapshots
//! - [`error`]: Error types for firewall operations

pub mod compose;
pub mod diagnostics;
pub mod driver;
pub mod error;
pub mod firewall;
pub mod rules;

#[cfg(test)]
pub mod test_helpers;
