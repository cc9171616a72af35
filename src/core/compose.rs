//! Rule transaction composer
//!
//! Turns a [`FirewallConfiguration`] into the ordered list of mutations a run
//! dispatches. iptables evaluates rules first-match-wins, so the order here is
//! the behaviour:
//!
//! 1. Cleanup of a previous run (errors ignored): remove both hook jumps,
//!    then flush and delete both custom chains. Jumps are deleted by the exact
//!    spec found in the pre-run dump, since their comments carry the earlier
//!    run's trace id.
//! 2. Inbound (`PREROUTING`): create `PROXY_INIT_REDIRECT`, ignored ports,
//!    redirect rule(s) by mode, jump from `PREROUTING`.
//! 3. Outbound (`OUTPUT`): create `PROXY_INIT_OUTPUT`, proxy uid hairpin and
//!    exemption, loopback exemption, ignored ports, catch-all redirect, jump
//!    from `OUTPUT`.
//!
//! The inbound chain is installed first because the outbound hairpin rule
//! jumps into it and iptables refuses jumps to chains that do not exist.

use crate::core::diagnostics::RulesetSnapshot;
use crate::core::firewall::{
    FirewallConfiguration, HookChain, OUTPUT_CHAIN_NAME, REDIRECT_CHAIN_NAME, RedirectMode,
};
use crate::core::rules::{JumpAction, RuleBuilder, RuleMutation};
use tracing::info;

pub const INSTALL_OUTPUT_LABEL: &str = "install-proxy-init-output";
pub const INSTALL_PREROUTING_LABEL: &str = "install-proxy-init-prerouting";
const COMMON_CHAIN_LABEL: &str = "redirect-common-chain";

/// Stage of a run a mutation belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Phase {
    /// Best effort: failures are logged and ignored
    #[strum(serialize = "cleanup")]
    Cleanup,
    /// Fail fast: the first failure aborts the run
    #[strum(serialize = "install")]
    Install,
}

/// Everything a run dispatches besides the diagnostic dumps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub cleanup: Vec<RuleMutation>,
    pub install: Vec<RuleMutation>,
}

impl Transaction {
    /// All mutations in dispatch order, paired with their phase.
    pub fn iter(&self) -> impl Iterator<Item = (Phase, &RuleMutation)> {
        self.cleanup
            .iter()
            .map(|m| (Phase::Cleanup, m))
            .chain(self.install.iter().map(|m| (Phase::Install, m)))
    }

    pub fn len(&self) -> usize {
        self.cleanup.len() + self.install.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Composes the full transaction for one run.
///
/// `previous` is the rule table dump taken before cleanup, when there is one.
pub fn compose(
    config: &FirewallConfiguration,
    rules: &RuleBuilder,
    previous: Option<&RulesetSnapshot>,
) -> Transaction {
    let mut install = inbound_rules(config, rules);
    install.extend(outbound_rules(config, rules));

    Transaction {
        cleanup: cleanup_rules(rules, previous),
        install,
    }
}

/// Removes whatever a previous run left behind.
///
/// Each hook jump found in `previous` gets its own delete. Without a dump, or
/// when the dump holds no such jump, a bare delete is still issued.
pub fn cleanup_rules(
    rules: &RuleBuilder,
    previous: Option<&RulesetSnapshot>,
) -> Vec<RuleMutation> {
    let mut commands = Vec::new();
    for (hook, chain, label) in [
        (HookChain::Output, OUTPUT_CHAIN_NAME, INSTALL_OUTPUT_LABEL),
        (HookChain::Prerouting, REDIRECT_CHAIN_NAME, INSTALL_PREROUTING_LABEL),
    ] {
        let saved = previous
            .map(|dump| dump.saved_jumps(hook.as_str(), chain))
            .unwrap_or_default();
        if saved.is_empty() {
            commands.push(rules.delete_saved_jump(hook, chain, None, label));
        }
        for jump in &saved {
            commands.push(rules.delete_saved_jump(hook, chain, jump.comment.as_deref(), label));
        }
    }

    for chain in [OUTPUT_CHAIN_NAME, REDIRECT_CHAIN_NAME] {
        commands.push(rules.flush_chain(chain));
        commands.push(rules.delete_chain(chain));
    }
    commands
}

/// `OUTPUT` side: everything locally generated that isn't exempt goes to the
/// proxy's outgoing port.
pub fn outbound_rules(config: &FirewallConfiguration, rules: &RuleBuilder) -> Vec<RuleMutation> {
    let mut commands = vec![rules.create_chain(OUTPUT_CHAIN_NAME, COMMON_CHAIN_LABEL)];

    if let Some(uid) = config.proxy_uid {
        info!("Ignoring uid {uid}");
        // app -> proxy(outbound) -> proxy(inbound) -> app
        commands.push(rules.redirect_uid_loopback_to_chain(
            OUTPUT_CHAIN_NAME,
            REDIRECT_CHAIN_NAME,
            uid,
            "redirect-non-loopback-local-traffic",
        ));
        commands.push(rules.ignore_uid(OUTPUT_CHAIN_NAME, uid, "ignore-proxy-user-id"));
    } else {
        info!("Not ignoring any uid");
    }

    commands.push(rules.ignore_loopback(OUTPUT_CHAIN_NAME, "ignore-loopback"));
    commands.extend(ignored_port_rules(
        &config.outbound_ports_to_ignore,
        OUTPUT_CHAIN_NAME,
        rules,
    ));

    info!("Redirecting all OUTPUT to {}", config.proxy_outgoing_port);
    commands.push(rules.redirect_to_port(
        OUTPUT_CHAIN_NAME,
        config.proxy_outgoing_port,
        "redirect-all-outgoing-to-proxy-port",
    ));

    commands.push(rules.jump(
        HookChain::Output,
        OUTPUT_CHAIN_NAME,
        INSTALL_OUTPUT_LABEL,
        JumpAction::Append,
    ));
    commands
}

/// `PREROUTING` side: inbound connections go to the proxy's inbound port,
/// either all of them or only the listed destination ports.
pub fn inbound_rules(config: &FirewallConfiguration, rules: &RuleBuilder) -> Vec<RuleMutation> {
    let mut commands = vec![rules.create_chain(REDIRECT_CHAIN_NAME, COMMON_CHAIN_LABEL)];
    commands.extend(ignored_port_rules(
        &config.inbound_ports_to_ignore,
        REDIRECT_CHAIN_NAME,
        rules,
    ));

    match config.mode {
        RedirectMode::RedirectAll => {
            info!("Will redirect all INPUT ports to proxy");
            commands.push(rules.redirect_to_port(
                REDIRECT_CHAIN_NAME,
                config.proxy_inbound_port,
                "redirect-all-incoming-to-proxy-port",
            ));
        }
        RedirectMode::RedirectListed => {
            info!(
                "Will redirect some INPUT ports to proxy: {:?}",
                config.ports_to_redirect_inbound
            );
            for &port in &config.ports_to_redirect_inbound {
                commands.push(rules.redirect_destination_port(
                    REDIRECT_CHAIN_NAME,
                    port,
                    config.proxy_inbound_port,
                    &format!("redirect-port-{port}-to-proxy-port"),
                ));
            }
        }
    }

    commands.push(rules.jump(
        HookChain::Prerouting,
        REDIRECT_CHAIN_NAME,
        INSTALL_PREROUTING_LABEL,
        JumpAction::Append,
    ));
    commands
}

fn ignored_port_rules<'a>(
    ports: &'a [u16],
    chain: &'a str,
    rules: &'a RuleBuilder,
) -> impl Iterator<Item = RuleMutation> + 'a {
    ports.iter().map(move |&port| {
        info!("Will ignore port {port} on chain {chain}");
        rules.ignore_port(chain, port, &format!("ignore-port-{port}"))
    })
}
