//! Rule primitives
//!
//! A [`RuleMutation`] fully describes one `iptables` (or `iptables-save`)
//! invocation without running it. [`RuleBuilder`] produces them; every
//! mutation it builds is tagged with `proxy-init/<label>/<trace-id>`, which is
//! attached as an iptables comment to the chains and rules it creates.
//!
//! Deletes carry the tag but never render it: `iptables -D` matches the whole
//! rule spec, comment included, and the rule being removed was written by an
//! earlier run with a different trace id.
//!
//! # Example
//!
//! ```
//! use proxy_init::core::diagnostics::TraceId;
//! use proxy_init::core::rules::RuleBuilder;
//!
//! let rules = RuleBuilder::new(TraceId::new("1700000000"));
//! let mutation = rules.ignore_port("PROXY_INIT_OUTPUT", 22, "ignore-port-22");
//! assert_eq!(
//!     mutation.args(),
//!     [
//!         "-t", "nat", "-A", "PROXY_INIT_OUTPUT", "-p", "tcp", "--destination-port", "22",
//!         "-j", "RETURN", "-m", "comment", "--comment", "proxy-init/ignore-port-22/1700000000",
//!     ]
//! );
//! ```

use crate::core::diagnostics::TraceId;
use crate::core::firewall::{HookChain, NAT_TABLE};
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;

/// First segment of every comment this tool writes
pub const COMMENT_NAMESPACE: &str = "proxy-init";

/// Interface matched by the loopback rules
pub const LOOPBACK_INTERFACE: &str = "lo";

/// External program a mutation is dispatched to
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Tool {
    #[strum(serialize = "iptables")]
    Iptables,
    #[strum(serialize = "iptables-save")]
    IptablesSave,
}

/// What a mutation does to its chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Operation {
    #[strum(serialize = "create-chain")]
    CreateChain,
    #[strum(serialize = "flush-chain")]
    FlushChain,
    #[strum(serialize = "delete-chain")]
    DeleteChain,
    #[strum(serialize = "append")]
    Append,
    #[strum(serialize = "delete")]
    Delete,
    /// Non-mutating dump of the whole rule table
    #[strum(serialize = "list-all")]
    ListAll,
}

impl Operation {
    const fn flag(self) -> Option<&'static str> {
        match self {
            Operation::CreateChain => Some("-N"),
            Operation::FlushChain => Some("-F"),
            Operation::DeleteChain => Some("-X"),
            Operation::Append => Some("-A"),
            Operation::Delete => Some("-D"),
            Operation::ListAll => None,
        }
    }

    /// Operations that render `-m comment`
    const fn takes_comment(self) -> bool {
        matches!(self, Operation::CreateChain | Operation::Append)
    }
}

/// Match predicate of a rule, rendered in the order it was added
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Match {
    Tcp,
    DestinationPort(u16),
    OutInterface(String),
    NotDestination(Ipv4Network),
    UidOwner(u32),
    /// A comment already present on a saved rule
    Comment(String),
}

impl Match {
    fn push_args(&self, args: &mut Vec<String>) {
        match self {
            Match::Tcp => args.extend(["-p".into(), "tcp".into()]),
            Match::DestinationPort(port) => {
                args.extend(["--destination-port".into(), port.to_string()]);
            }
            Match::OutInterface(name) => args.extend(["-o".into(), name.clone()]),
            Match::NotDestination(network) => {
                args.extend(["!".into(), "-d".into(), network.to_string()]);
            }
            Match::UidOwner(uid) => args.extend([
                "-m".into(),
                "owner".into(),
                "--uid-owner".into(),
                uid.to_string(),
            ]),
            Match::Comment(text) => args.extend([
                "-m".into(),
                "comment".into(),
                "--comment".into(),
                text.clone(),
            ]),
        }
    }
}

/// Rule verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Return,
    Redirect { to_port: u16 },
    Jump(String),
}

impl Target {
    fn push_args(&self, args: &mut Vec<String>) {
        args.push("-j".into());
        match self {
            Target::Return => args.push("RETURN".into()),
            Target::Redirect { to_port } => {
                args.extend(["REDIRECT".into(), "--to-port".into(), to_port.to_string()]);
            }
            Target::Jump(chain) => args.push(chain.clone()),
        }
    }
}

/// One firewall command, described but not executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMutation {
    pub tool: Tool,
    pub operation: Operation,
    pub chain: Option<String>,
    pub matches: Vec<Match>,
    pub target: Option<Target>,
    /// `proxy-init/<label>/<trace-id>`
    pub tag: String,
}

impl RuleMutation {
    /// Arguments passed to [`Self::tool`], without the program name.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        let Some(flag) = self.operation.flag() else {
            return args;
        };

        args.extend(["-t".into(), NAT_TABLE.into(), flag.into()]);
        if let Some(chain) = &self.chain {
            args.push(chain.clone());
        }
        for m in &self.matches {
            m.push_args(&mut args);
        }
        if let Some(target) = &self.target {
            target.push_args(&mut args);
        }
        if self.operation.takes_comment() {
            args.extend([
                "-m".into(),
                "comment".into(),
                "--comment".into(),
                self.tag.clone(),
            ]);
        }
        args
    }

    /// Whether dispatching this changes the rule table
    pub fn is_mutating(&self) -> bool {
        self.operation != Operation::ListAll
    }
}

/// Whether a jump rule is installed or removed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpAction {
    Append,
    Delete,
}

/// Builds [`RuleMutation`]s tagged with one run's trace id.
#[derive(Debug, Clone)]
pub struct RuleBuilder {
    trace_id: TraceId,
}

impl RuleBuilder {
    pub fn new(trace_id: TraceId) -> Self {
        Self { trace_id }
    }

    pub fn trace_id(&self) -> &TraceId {
        &self.trace_id
    }

    /// Formats a comment so rules can be traced back to the run that added them.
    pub fn format_comment(&self, label: &str) -> String {
        format!(
            "{COMMENT_NAMESPACE}/{}/{}",
            crate::validators::sanitize_label(label),
            self.trace_id
        )
    }

    fn mutation(
        &self,
        operation: Operation,
        chain: &str,
        matches: Vec<Match>,
        target: Option<Target>,
        label: &str,
    ) -> RuleMutation {
        RuleMutation {
            tool: Tool::Iptables,
            operation,
            chain: Some(chain.to_string()),
            matches,
            target,
            tag: self.format_comment(label),
        }
    }

    pub fn create_chain(&self, name: &str, label: &str) -> RuleMutation {
        self.mutation(Operation::CreateChain, name, Vec::new(), None, label)
    }

    pub fn flush_chain(&self, name: &str) -> RuleMutation {
        self.mutation(Operation::FlushChain, name, Vec::new(), None, "flush-chain")
    }

    pub fn delete_chain(&self, name: &str) -> RuleMutation {
        self.mutation(Operation::DeleteChain, name, Vec::new(), None, "delete-chain")
    }

    /// Lets TCP traffic to `port` leave the chain unredirected.
    pub fn ignore_port(&self, chain: &str, port: u16, label: &str) -> RuleMutation {
        self.mutation(
            Operation::Append,
            chain,
            vec![Match::Tcp, Match::DestinationPort(port)],
            Some(Target::Return),
            label,
        )
    }

    pub fn ignore_loopback(&self, chain: &str, label: &str) -> RuleMutation {
        self.mutation(
            Operation::Append,
            chain,
            vec![Match::OutInterface(LOOPBACK_INTERFACE.to_string())],
            Some(Target::Return),
            label,
        )
    }

    pub fn ignore_uid(&self, chain: &str, uid: u32, label: &str) -> RuleMutation {
        self.mutation(
            Operation::Append,
            chain,
            vec![Match::UidOwner(uid)],
            Some(Target::Return),
            label,
        )
    }

    /// Redirects all TCP traffic reaching this rule to `to_port`.
    pub fn redirect_to_port(&self, chain: &str, to_port: u16, label: &str) -> RuleMutation {
        self.mutation(
            Operation::Append,
            chain,
            vec![Match::Tcp],
            Some(Target::Redirect { to_port }),
            label,
        )
    }

    /// Redirects TCP traffic for `destination_port` to `to_port`.
    pub fn redirect_destination_port(
        &self,
        chain: &str,
        destination_port: u16,
        to_port: u16,
        label: &str,
    ) -> RuleMutation {
        self.mutation(
            Operation::Append,
            chain,
            vec![Match::Tcp, Match::DestinationPort(destination_port)],
            Some(Target::Redirect { to_port }),
            label,
        )
    }

    /// Jump rule from a hook chain into one of our chains, for every protocol.
    pub fn jump(
        &self,
        hook: HookChain,
        target_chain: &str,
        label: &str,
        action: JumpAction,
    ) -> RuleMutation {
        let operation = match action {
            JumpAction::Append => Operation::Append,
            JumpAction::Delete => Operation::Delete,
        };
        self.mutation(
            operation,
            hook.as_str(),
            Vec::new(),
            Some(Target::Jump(target_chain.to_string())),
            label,
        )
    }

    /// Removes a jump found in a rule table dump.
    ///
    /// `saved_comment` is the comment the jump was installed with, if any. It
    /// becomes part of the rule spec so `-D` matches the saved rule exactly.
    pub fn delete_saved_jump(
        &self,
        hook: HookChain,
        target_chain: &str,
        saved_comment: Option<&str>,
        label: &str,
    ) -> RuleMutation {
        let mut mutation = self.jump(hook, target_chain, label, JumpAction::Delete);
        if let Some(comment) = saved_comment {
            mutation.matches.push(Match::Comment(comment.to_string()));
        }
        mutation
    }

    /// Sends the proxy's own non-loopback-destined traffic leaving through `lo`
    /// into the inbound chain, so proxy -> app calls inside the pod are
    /// intercepted by the proxy's inbound side.
    pub fn redirect_uid_loopback_to_chain(
        &self,
        chain: &str,
        target_chain: &str,
        uid: u32,
        label: &str,
    ) -> RuleMutation {
        self.mutation(
            Operation::Append,
            chain,
            vec![
                Match::UidOwner(uid),
                Match::OutInterface(LOOPBACK_INTERFACE.to_string()),
                Match::NotDestination(Ipv4Network::from(Ipv4Addr::LOCALHOST)),
            ],
            Some(Target::Jump(target_chain.to_string())),
            label,
        )
    }

    /// Dumps the full rule table in restorable form.
    pub fn show_all_rules(&self) -> RuleMutation {
        RuleMutation {
            tool: Tool::IptablesSave,
            operation: Operation::ListAll,
            chain: None,
            matches: Vec::new(),
            target: None,
            tag: self.format_comment("show-all-rules"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> RuleBuilder {
        RuleBuilder::new(TraceId::new("1700000000"))
    }

    #[test]
    fn test_format_comment() {
        assert_eq!(
            builder().format_comment("ignore-loopback"),
            "proxy-init/ignore-loopback/1700000000"
        );
    }

    #[test]
    fn test_create_chain_args() {
        let m = builder().create_chain("PROXY_INIT_OUTPUT", "redirect-common-chain");
        assert_eq!(
            m.args(),
            [
                "-t",
                "nat",
                "-N",
                "PROXY_INIT_OUTPUT",
                "-m",
                "comment",
                "--comment",
                "proxy-init/redirect-common-chain/1700000000"
            ]
        );
        assert_eq!(m.tool, Tool::Iptables);
    }

    #[test]
    fn test_flush_and_delete_have_no_comment() {
        let rules = builder();
        assert_eq!(rules.flush_chain("X").args(), ["-t", "nat", "-F", "X"]);
        assert_eq!(rules.delete_chain("X").args(), ["-t", "nat", "-X", "X"]);
    }

    #[test]
    fn test_ignore_uid_args() {
        let m = builder().ignore_uid("PROXY_INIT_OUTPUT", 2102, "ignore-proxy-user-id");
        assert_eq!(
            m.args(),
            [
                "-t",
                "nat",
                "-A",
                "PROXY_INIT_OUTPUT",
                "-m",
                "owner",
                "--uid-owner",
                "2102",
                "-j",
                "RETURN",
                "-m",
                "comment",
                "--comment",
                "proxy-init/ignore-proxy-user-id/1700000000"
            ]
        );
    }

    #[test]
    fn test_ignore_loopback_args() {
        let m = builder().ignore_loopback("PROXY_INIT_OUTPUT", "ignore-loopback");
        assert_eq!(
            &m.args()[..8],
            ["-t", "nat", "-A", "PROXY_INIT_OUTPUT", "-o", "lo", "-j", "RETURN"]
        );
    }

    #[test]
    fn test_redirect_to_port_args() {
        let m = builder().redirect_to_port(
            "PROXY_INIT_OUTPUT",
            4140,
            "redirect-all-outgoing-to-proxy-port",
        );
        assert_eq!(
            &m.args()[..10],
            [
                "-t",
                "nat",
                "-A",
                "PROXY_INIT_OUTPUT",
                "-p",
                "tcp",
                "-j",
                "REDIRECT",
                "--to-port",
                "4140"
            ]
        );
    }

    #[test]
    fn test_redirect_destination_port_args() {
        let m = builder().redirect_destination_port(
            "PROXY_INIT_REDIRECT",
            8080,
            4143,
            "redirect-port-8080-to-proxy-port",
        );
        assert_eq!(
            &m.args()[..12],
            [
                "-t",
                "nat",
                "-A",
                "PROXY_INIT_REDIRECT",
                "-p",
                "tcp",
                "--destination-port",
                "8080",
                "-j",
                "REDIRECT",
                "--to-port",
                "4143"
            ]
        );
    }

    #[test]
    fn test_jump_append_and_delete() {
        let rules = builder();
        let label = "install-proxy-init-output";
        let append = rules.jump(HookChain::Output, "PROXY_INIT_OUTPUT", label, JumpAction::Append);
        let delete = rules.jump(HookChain::Output, "PROXY_INIT_OUTPUT", label, JumpAction::Delete);

        assert_eq!(
            &append.args()[..6],
            ["-t", "nat", "-A", "OUTPUT", "-j", "PROXY_INIT_OUTPUT"]
        );
        assert_eq!(append.args().len(), 10);
        // The delete keeps its tag but never renders this run's comment
        assert_eq!(
            delete.args(),
            ["-t", "nat", "-D", "OUTPUT", "-j", "PROXY_INIT_OUTPUT"]
        );
        assert_eq!(append.tag, delete.tag);
    }

    #[test]
    fn test_delete_saved_jump_uses_saved_comment() {
        let rules = builder();
        let saved = "proxy-init/install-proxy-init-output/1600000000";
        let delete = rules.delete_saved_jump(
            HookChain::Output,
            "PROXY_INIT_OUTPUT",
            Some(saved),
            "install-proxy-init-output",
        );

        assert_eq!(
            delete.args(),
            [
                "-t",
                "nat",
                "-D",
                "OUTPUT",
                "-m",
                "comment",
                "--comment",
                saved,
                "-j",
                "PROXY_INIT_OUTPUT"
            ]
        );
        assert!(delete.tag.ends_with("/1700000000"));

        let bare = rules.delete_saved_jump(HookChain::Output, "PROXY_INIT_OUTPUT", None, "x");
        assert_eq!(bare.args(), ["-t", "nat", "-D", "OUTPUT", "-j", "PROXY_INIT_OUTPUT"]);
    }

    #[test]
    fn test_hairpin_rule_negates_localhost() {
        let m = builder().redirect_uid_loopback_to_chain(
            "PROXY_INIT_OUTPUT",
            "PROXY_INIT_REDIRECT",
            2102,
            "redirect-non-loopback-local-traffic",
        );
        assert_eq!(
            &m.args()[..15],
            [
                "-t",
                "nat",
                "-A",
                "PROXY_INIT_OUTPUT",
                "-m",
                "owner",
                "--uid-owner",
                "2102",
                "-o",
                "lo",
                "!",
                "-d",
                "127.0.0.1/32",
                "-j",
                "PROXY_INIT_REDIRECT"
            ]
        );
    }

    #[test]
    fn test_show_all_rules_is_not_mutating() {
        let m = builder().show_all_rules();
        assert_eq!(m.tool, Tool::IptablesSave);
        assert!(m.args().is_empty());
        assert!(!m.is_mutating());
        assert!(builder().flush_chain("X").is_mutating());
    }

    #[test]
    fn test_every_mutation_carries_trace_id() {
        let rules = builder();
        let all = [
            rules.create_chain("A", "a"),
            rules.flush_chain("A"),
            rules.delete_chain("A"),
            rules.ignore_port("A", 1, "b"),
            rules.ignore_loopback("A", "c"),
            rules.ignore_uid("A", 1, "d"),
            rules.redirect_to_port("A", 1, "e"),
            rules.redirect_destination_port("A", 1, 2, "f"),
            rules.jump(HookChain::Prerouting, "A", "g", JumpAction::Append),
            rules.show_all_rules(),
        ];
        assert!(all.iter().all(|m| m.tag.ends_with("/1700000000")));
    }
}
