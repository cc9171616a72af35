//! Execution driver
//!
//! Dispatches composed [`RuleMutation`]s to the external tools, one at a time
//! and in order. Two entry points make the failure policy explicit:
//!
//! - [`Driver::run_or_abort`]: installation. A failure is returned to the
//!   caller, which stops the run. Nothing already applied is rolled back.
//! - [`Driver::run_best_effort`]: cleanup of a previous run. A failure is
//!   logged and recorded, never returned; on a first run the chains being
//!   removed simply don't exist.
//!
//! With `simulate_only` set nothing is dispatched; the driver only logs what
//! it would have run.

use crate::core::compose::{Transaction, compose};
use crate::core::diagnostics::{RulesetSnapshot, TraceId, diff_snapshots};
use crate::core::error::{Error, Result};
use crate::core::firewall::FirewallConfiguration;
use crate::core::rules::{RuleBuilder, RuleMutation, Tool};
use std::fmt;
use tracing::{debug, error, info, warn};

/// Makes iptables wait for the xtables lock instead of failing
pub const WAIT_FLAG: &str = "-w";

/// Locations of the external programs
///
/// Distro packagers can bake in absolute paths with the `PROXY_INIT_IPTABLES`
/// and `PROXY_INIT_IPTABLES_SAVE` build-time environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tools {
    pub iptables: String,
    pub iptables_save: String,
    pub nsenter: String,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            iptables: option_env!("PROXY_INIT_IPTABLES")
                .unwrap_or("iptables")
                .to_string(),
            iptables_save: option_env!("PROXY_INIT_IPTABLES_SAVE")
                .unwrap_or("iptables-save")
                .to_string(),
            nsenter: "nsenter".to_string(),
        }
    }
}

impl Tools {
    pub fn program(&self, tool: Tool) -> &str {
        match tool {
            Tool::Iptables => &self.iptables,
            Tool::IptablesSave => &self.iptables_save,
        }
    }
}

/// A concrete command line, ready to spawn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// What a finished process left behind
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Runs an [`Invocation`] to completion.
///
/// The seam between the driver and the operating system; tests substitute a
/// recording double.
#[allow(async_fn_in_trait)]
pub trait CommandRunner {
    async fn run(&mut self, invocation: &Invocation) -> std::io::Result<CommandOutput>;
}

impl<T: CommandRunner> CommandRunner for &mut T {
    async fn run(&mut self, invocation: &Invocation) -> std::io::Result<CommandOutput> {
        (**self).run(invocation).await
    }
}

/// Spawns real processes with `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    async fn run(&mut self, invocation: &Invocation) -> std::io::Result<CommandOutput> {
        let output = tokio::process::Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(std::process::Stdio::null())
            .output()
            .await?;

        Ok(CommandOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// The parts of a configuration that affect how commands are dispatched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    pub simulate_only: bool,
    pub net_ns: Option<String>,
    pub use_wait_flag: bool,
}

impl From<&FirewallConfiguration> for DispatchOptions {
    fn from(config: &FirewallConfiguration) -> Self {
        Self {
            simulate_only: config.simulate_only,
            net_ns: config.net_ns.clone(),
            use_wait_flag: config.use_wait_flag,
        }
    }
}

/// Applies mutations one at a time.
pub struct Driver<'a, R> {
    options: DispatchOptions,
    tools: &'a Tools,
    runner: R,
    dispatched: usize,
    ignored_failures: Vec<String>,
}

impl<'a, R: CommandRunner> Driver<'a, R> {
    pub fn new(options: DispatchOptions, tools: &'a Tools, runner: R) -> Self {
        Self {
            options,
            tools,
            runner,
            dispatched: 0,
            ignored_failures: Vec::new(),
        }
    }

    /// The command line a mutation turns into under these options.
    pub fn invocation(&self, mutation: &RuleMutation) -> Invocation {
        let mut args = mutation.args();
        if self.options.use_wait_flag && mutation.tool == Tool::Iptables {
            args.push(WAIT_FLAG.to_string());
        }

        let program = self.tools.program(mutation.tool);
        match self.options.net_ns.as_deref() {
            Some(net_ns) => {
                let (program, args) = crate::namespace::wrap_in_namespace(
                    &self.tools.nsenter,
                    net_ns,
                    program,
                    args,
                );
                Invocation { program, args }
            }
            None => Invocation {
                program: program.to_string(),
                args,
            },
        }
    }

    /// Dispatches a mutation; `Ok(None)` when simulating.
    async fn dispatch(&mut self, mutation: &RuleMutation) -> Result<Option<CommandOutput>> {
        let invocation = self.invocation(mutation);

        if self.options.simulate_only {
            debug!("Simulating: {invocation}");
            return Ok(None);
        }

        info!(":; {invocation}");
        self.dispatched += 1;

        let output = self
            .runner
            .run(&invocation)
            .await
            .map_err(|source| Error::Spawn {
                command: invocation.to_string(),
                source,
            })?;

        let combined = output.combined();
        if !combined.is_empty() {
            if mutation.is_mutating() {
                info!("{}", combined.trim_end());
            } else {
                debug!("{}", combined.trim_end());
            }
        }

        if output.success {
            Ok(Some(output))
        } else {
            Err(Error::Command {
                command: invocation.to_string(),
                exit_code: output.exit_code,
                output: combined,
            })
        }
    }

    /// Runs a mutation whose failure must stop the run.
    pub async fn run_or_abort(&mut self, mutation: &RuleMutation) -> Result<Option<CommandOutput>> {
        self.dispatch(mutation).await.inspect_err(|e| {
            error!("{e}");
        })
    }

    /// Runs a mutation whose failure is expected and harmless.
    ///
    /// Returns the output on success, `None` on failure or when simulating.
    pub async fn run_best_effort(&mut self, mutation: &RuleMutation) -> Option<CommandOutput> {
        match self.dispatch(mutation).await {
            Ok(output) => output,
            Err(e) => {
                warn!("Ignoring failure: {e}");
                let command = self.invocation(mutation).to_string();
                self.ignored_failures.push(command);
                None
            }
        }
    }

    /// Number of commands handed to the runner so far
    pub fn dispatched(&self) -> usize {
        self.dispatched
    }

    /// Command lines whose best-effort failure was ignored
    pub fn ignored_failures(&self) -> &[String] {
        &self.ignored_failures
    }

    pub fn into_runner(self) -> R {
        self.runner
    }
}

/// Outcome of a completed run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub trace_id: TraceId,
    pub simulated: bool,
    pub transaction: Transaction,
    /// Rule table before cleanup; `None` when simulating
    pub before: Option<RulesetSnapshot>,
    /// Rule table after installation; `None` when simulating or if the dump failed
    pub after: Option<RulesetSnapshot>,
    pub dispatched: usize,
    pub ignored_failures: Vec<String>,
}

impl RunReport {
    /// Line diff of the rule table, when both dumps were captured.
    pub fn diff(&self) -> Option<String> {
        match (&self.before, &self.after) {
            (Some(before), Some(after)) => Some(diff_snapshots(before, after)),
            _ => None,
        }
    }
}

/// Configures the NAT table to route TCP traffic through the proxy.
///
/// Dumps the rule table, removes what a previous run left, installs the
/// inbound and outbound chains, then dumps the table again. The first failed
/// installation command aborts the run and is returned.
///
/// # Errors
///
/// Returns `Err` if:
/// - The initial rule table dump fails (the tools are unusable)
/// - Any installation command fails to start or exits non-zero
pub async fn configure_firewall<R: CommandRunner>(
    config: &FirewallConfiguration,
    tools: &Tools,
    trace_id: TraceId,
    runner: R,
) -> Result<RunReport> {
    info!("Tracing this script execution as [{trace_id}]");

    let rules = RuleBuilder::new(trace_id.clone());
    let mut driver = Driver::new(DispatchOptions::from(config), tools, runner);

    info!("current state");
    let before = match driver.run_or_abort(&rules.show_all_rules()).await {
        Ok(output) => output.map(|o| RulesetSnapshot::new(o.stdout)),
        Err(e) => {
            error!("Aborting firewall configuration");
            return Err(e);
        }
    };

    let transaction = compose(config, &rules, before.as_ref());

    info!("cleanup");
    for mutation in &transaction.cleanup {
        driver.run_best_effort(mutation).await;
    }

    info!("adding rules");
    for mutation in &transaction.install {
        if let Err(e) = driver.run_or_abort(mutation).await {
            error!("Aborting firewall configuration");
            return Err(e);
        }
    }

    info!("end state");
    let after = driver
        .run_best_effort(&rules.show_all_rules())
        .await
        .map(|o| RulesetSnapshot::new(o.stdout));

    Ok(RunReport {
        trace_id,
        simulated: config.simulate_only,
        dispatched: driver.dispatched(),
        ignored_failures: driver.ignored_failures().to_vec(),
        transaction,
        before,
        after,
    })
}

/// Dumps the current rule table.
///
/// # Errors
///
/// Returns `Err` if `iptables-save` cannot be run or exits non-zero.
pub async fn show_rules<R: CommandRunner>(
    tools: &Tools,
    net_ns: Option<String>,
    runner: R,
) -> Result<RulesetSnapshot> {
    let options = DispatchOptions {
        net_ns,
        ..DispatchOptions::default()
    };
    let mut driver = Driver::new(options, tools, runner);
    let rules = RuleBuilder::new(TraceId::generate());

    let output = driver.run_or_abort(&rules.show_all_rules()).await?;
    Ok(RulesetSnapshot::new(output.map(|o| o.stdout).unwrap_or_default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::firewall::{OUTPUT_CHAIN_NAME, REDIRECT_CHAIN_NAME};
    use crate::core::test_helpers::{RecordingRunner, SAMPLE_DUMP, test_config};

    fn trace() -> TraceId {
        TraceId::new("1700000000")
    }

    #[tokio::test]
    async fn test_full_run_dispatch_order() {
        let config = test_config();
        let tools = Tools::default();
        let mut runner = RecordingRunner::default();

        let report = configure_firewall(&config, &tools, trace(), &mut runner)
            .await
            .unwrap();

        // dump + cleanup + install + dump
        assert_eq!(runner.calls.len(), report.transaction.len() + 2);
        assert_eq!(report.dispatched, runner.calls.len());
        assert_eq!(runner.calls[0].program, "iptables-save");
        assert_eq!(runner.calls.last().unwrap().program, "iptables-save");
        assert_eq!(runner.calls[1].args[2], "-D");
        assert_eq!(report.before.as_ref().unwrap().text, SAMPLE_DUMP);
        assert!(report.ignored_failures.is_empty());
    }

    #[tokio::test]
    async fn test_simulate_dispatches_nothing() {
        let config = FirewallConfiguration {
            simulate_only: true,
            ..test_config()
        };
        let mut runner = RecordingRunner::default();

        let report = configure_firewall(&config, &Tools::default(), trace(), &mut runner)
            .await
            .unwrap();

        assert!(runner.calls.is_empty());
        assert!(!report.transaction.is_empty());
        assert_eq!(report.dispatched, 0);
        assert!(report.simulated);
        assert!(report.before.is_none());
        assert!(report.diff().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_failures_do_not_abort() {
        let config = test_config();
        let mut runner = RecordingRunner::default()
            .fail_on(" -D ", "iptables: No chain/target/match by that name.")
            .fail_on(" -F ", "iptables: No chain/target/match by that name.")
            .fail_on(" -X ", "iptables: No chain/target/match by that name.");

        let report = configure_firewall(&config, &Tools::default(), trace(), &mut runner)
            .await
            .unwrap();

        assert_eq!(report.ignored_failures.len(), 6);
        assert_eq!(runner.calls.len(), report.transaction.len() + 2);
    }

    #[tokio::test]
    async fn test_install_failure_aborts_immediately() {
        let config = test_config();
        let mut runner = RecordingRunner::default()
            .fail_on(&format!("-N {OUTPUT_CHAIN_NAME}"), "iptables: Chain already exists.");

        let err = configure_firewall(&config, &Tools::default(), trace(), &mut runner)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Command { exit_code: Some(1), .. }));
        assert!(err.detail().contains("Chain already exists"));
        let last = runner.calls.last().unwrap().to_string();
        assert!(last.contains(&format!("-N {OUTPUT_CHAIN_NAME}")));
        assert!(!runner.calls.iter().any(|c| c.to_string().contains("-A OUTPUT")));
    }

    #[tokio::test]
    async fn test_initial_dump_failure_aborts_run() {
        let config = test_config();
        let mut runner = RecordingRunner::default().fail_on("iptables-save", "permission denied");

        let err = configure_firewall(&config, &Tools::default(), trace(), &mut runner)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Command { .. }));
        assert_eq!(runner.calls.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_tool_is_spawn_error() {
        let config = test_config();
        let mut runner = RecordingRunner::default().missing("iptables-save");

        let err = configure_firewall(&config, &Tools::default(), trace(), &mut runner)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_final_dump_failure_is_ignored() {
        let config = test_config();
        let mut runner = RecordingRunner::default().fail_after("iptables-save", 1, "boom");

        let report = configure_firewall(&config, &Tools::default(), trace(), &mut runner)
            .await
            .unwrap();

        assert!(report.before.is_some());
        assert!(report.after.is_none());
        assert_eq!(report.ignored_failures.len(), 1);
    }

    #[test]
    fn test_invocation_wait_flag_only_on_iptables() {
        let config = FirewallConfiguration {
            use_wait_flag: true,
            ..test_config()
        };
        let tools = Tools::default();
        let options = DispatchOptions::from(&config);
        let driver = Driver::new(options, &tools, RecordingRunner::default());
        let rules = RuleBuilder::new(trace());

        let flush = driver.invocation(&rules.flush_chain(REDIRECT_CHAIN_NAME));
        assert_eq!(flush.args.last().map(String::as_str), Some(WAIT_FLAG));

        let dump = driver.invocation(&rules.show_all_rules());
        assert!(dump.args.is_empty());
    }

    #[test]
    fn test_invocation_in_namespace() {
        let config = FirewallConfiguration {
            net_ns: Some("/proc/42/ns/net".into()),
            use_wait_flag: true,
            ..test_config()
        };
        let tools = Tools::default();
        let options = DispatchOptions::from(&config);
        let driver = Driver::new(options, &tools, RecordingRunner::default());
        let rules = RuleBuilder::new(trace());

        let invocation = driver.invocation(&rules.flush_chain(REDIRECT_CHAIN_NAME));
        assert_eq!(invocation.program, "nsenter");
        assert_eq!(
            invocation.args,
            [
                "--net",
                "/proc/42/ns/net",
                "iptables",
                "-t",
                "nat",
                "-F",
                REDIRECT_CHAIN_NAME,
                "-w"
            ]
        );
        assert_eq!(
            invocation.to_string(),
            "nsenter --net /proc/42/ns/net iptables -t nat -F PROXY_INIT_REDIRECT -w"
        );
    }

    #[tokio::test]
    async fn test_dispatched_commands_share_trace_id() {
        let config = test_config();
        let mut runner = RecordingRunner::default();

        configure_firewall(&config, &Tools::default(), trace(), &mut runner)
            .await
            .unwrap();

        let comments: Vec<&String> = runner
            .calls
            .iter()
            .filter_map(|c| {
                c.args
                    .iter()
                    .position(|a| a == "--comment")
                    .map(|i| &c.args[i + 1])
            })
            .collect();
        assert!(!comments.is_empty());
        assert!(comments.iter().all(|c| c.ends_with("/1700000000")));
    }

    #[tokio::test]
    async fn test_rerun_removes_previous_jumps() {
        let leftover = "*nat
:PREROUTING ACCEPT [0:0]
:OUTPUT ACCEPT [0:0]
:PROXY_INIT_OUTPUT - [0:0]
:PROXY_INIT_REDIRECT - [0:0]
-A PREROUTING -m comment --comment \"proxy-init/install-proxy-init-prerouting/1699999000\" -j PROXY_INIT_REDIRECT
-A OUTPUT -m comment --comment \"proxy-init/install-proxy-init-output/1699999000\" -j PROXY_INIT_OUTPUT
COMMIT
";
        let mut runner = RecordingRunner::default().with_dump(leftover);

        configure_firewall(&test_config(), &Tools::default(), trace(), &mut runner)
            .await
            .unwrap();

        let deletes: Vec<String> = runner
            .calls
            .iter()
            .map(ToString::to_string)
            .filter(|c| c.contains(" -D "))
            .collect();
        assert_eq!(
            deletes,
            [
                "iptables -t nat -D OUTPUT -m comment --comment \
                 proxy-init/install-proxy-init-output/1699999000 -j PROXY_INIT_OUTPUT",
                "iptables -t nat -D PREROUTING -m comment --comment \
                 proxy-init/install-proxy-init-prerouting/1699999000 -j PROXY_INIT_REDIRECT",
            ]
        );
    }

    #[tokio::test]
    async fn test_show_rules_in_namespace() {
        let mut runner = RecordingRunner::default();
        let snapshot = show_rules(&Tools::default(), Some("/var/run/netns/pod".into()), &mut runner)
            .await
            .unwrap();

        assert_eq!(snapshot.text, SAMPLE_DUMP);
        assert_eq!(runner.calls.len(), 1);
        assert_eq!(
            runner.calls[0].to_string(),
            "nsenter --net /var/run/netns/pod iptables-save"
        );
    }

    #[test]
    fn test_combined_output() {
        let output = CommandOutput {
            success: false,
            exit_code: Some(1),
            stdout: "out".into(),
            stderr: "err\n".into(),
        };
        assert_eq!(output.combined(), "out\nerr\n");
    }
}
