//! proxy-init - Sidecar proxy traffic redirection
//!
//! Rewrites a pod's iptables NAT table so that TCP traffic is transparently
//! routed through a local proxy. Run once per pod, before the application
//! starts, with `CAP_NET_ADMIN`.
//!
//! # Usage
//!
//! ```bash
//! # Redirect everything except the proxy's own admin ports
//! proxy-init apply --incoming-proxy-port 4143 --outgoing-proxy-port 4140 \
//!     --proxy-uid 2102 --inbound-ports-to-ignore 4190,4191
//!
//! # Only redirect two inbound ports, inside another network namespace
//! proxy-init apply --incoming-proxy-port 4143 --outgoing-proxy-port 4140 \
//!     --ports-to-redirect 8080,9090 --netns /proc/4242/ns/net
//!
//! # Print the commands without touching the rule table
//! proxy-init plan --config proxy-init.json
//!
//! # Dump the current rule table
//! proxy-init show
//! ```

use clap::{Args, Parser, Subcommand};
use proxy_init::audit::{self, AuditEvent, AuditLog, EventType};
use proxy_init::config::{RawFirewallConfiguration, load_config};
use proxy_init::core::compose::{Phase, compose};
use proxy_init::core::diagnostics::{TraceId, end_section, start_section};
use proxy_init::core::driver::{
    DispatchOptions, Driver, ProcessRunner, RunReport, Tools, configure_firewall, show_rules,
};
use proxy_init::core::error::IptablesErrorPattern;
use proxy_init::core::rules::RuleBuilder;
use proxy_init::{FirewallConfiguration, RedirectMode, namespace};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::Level;

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "proxy-init")]
#[command(version = build::CLAP_LONG_VERSION)]
#[command(about = "Routes a pod's TCP traffic through its sidecar proxy", long_about = None)]
struct Cli {
    /// Log debug output, including simulated commands
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure the NAT table
    Apply {
        #[command(flatten)]
        firewall: FirewallArgs,
        #[command(flatten)]
        tools: ToolArgs,
        /// Append a JSON line describing the run to this file
        #[arg(long, value_name = "FILE", env = "PROXY_INIT_AUDIT_LOG")]
        audit_log: Option<PathBuf>,
    },
    /// Print the commands `apply` would run, without running them
    Plan {
        #[command(flatten)]
        firewall: FirewallArgs,
        #[command(flatten)]
        tools: ToolArgs,
    },
    /// Dump the current rule table
    Show {
        /// Network namespace to inspect
        #[arg(long, env = "PROXY_INIT_NETNS")]
        netns: Option<String>,
        #[command(flatten)]
        tools: ToolArgs,
    },
}

#[derive(Args)]
struct FirewallArgs {
    /// Read the configuration from a JSON document instead of flags
    #[arg(long, value_name = "FILE", env = "PROXY_INIT_CONFIG")]
    config: Option<PathBuf>,

    /// Port the proxy accepts redirected inbound connections on
    #[arg(
        long,
        env = "PROXY_INIT_INCOMING_PROXY_PORT",
        required_unless_present = "config",
        conflicts_with = "config"
    )]
    incoming_proxy_port: Option<i64>,

    /// Port the proxy accepts redirected outbound connections on
    #[arg(
        long,
        env = "PROXY_INIT_OUTGOING_PROXY_PORT",
        required_unless_present = "config",
        conflicts_with = "config"
    )]
    outgoing_proxy_port: Option<i64>,

    /// UID the proxy runs as; its own traffic is not redirected
    #[arg(
        long,
        env = "PROXY_INIT_PROXY_UID",
        allow_negative_numbers = true,
        conflicts_with = "config"
    )]
    proxy_uid: Option<i64>,

    /// Inbound ports that bypass the proxy
    #[arg(
        long,
        env = "PROXY_INIT_INBOUND_PORTS_TO_IGNORE",
        value_delimiter = ',',
        conflicts_with = "config"
    )]
    inbound_ports_to_ignore: Vec<i64>,

    /// Outbound ports that bypass the proxy
    #[arg(
        long,
        env = "PROXY_INIT_OUTBOUND_PORTS_TO_IGNORE",
        value_delimiter = ',',
        conflicts_with = "config"
    )]
    outbound_ports_to_ignore: Vec<i64>,

    /// Only redirect these inbound ports (default: all)
    #[arg(
        long,
        env = "PROXY_INIT_PORTS_TO_REDIRECT",
        value_delimiter = ',',
        conflicts_with = "config"
    )]
    ports_to_redirect: Vec<i64>,

    /// Log the commands instead of running them
    #[arg(long, env = "PROXY_INIT_SIMULATE")]
    simulate: bool,

    /// Network namespace to configure (default: the current one)
    #[arg(long, env = "PROXY_INIT_NETNS", conflicts_with = "config")]
    netns: Option<String>,

    /// Make iptables wait for the xtables lock
    #[arg(long, env = "PROXY_INIT_USE_WAIT_FLAG", conflicts_with = "config")]
    use_wait_flag: bool,
}

impl FirewallArgs {
    /// Builds the validated configuration from the document or the flags.
    async fn resolve(self) -> proxy_init::Result<FirewallConfiguration> {
        let mut config = match self.config {
            Some(path) => load_config(&path).await?,
            None => {
                let mode = if self.ports_to_redirect.is_empty() {
                    RedirectMode::RedirectAll
                } else {
                    RedirectMode::RedirectListed
                };

                FirewallConfiguration::try_from(RawFirewallConfiguration {
                    mode,
                    ports_to_redirect_inbound: self.ports_to_redirect,
                    inbound_ports_to_ignore: self.inbound_ports_to_ignore,
                    outbound_ports_to_ignore: self.outbound_ports_to_ignore,
                    // clap enforces presence unless --config is given
                    proxy_inbound_port: self.incoming_proxy_port.unwrap_or_default(),
                    proxy_outgoing_port: self.outgoing_proxy_port.unwrap_or_default(),
                    proxy_uid: self.proxy_uid.unwrap_or_default(),
                    simulate_only: false,
                    net_ns: self.netns.unwrap_or_default(),
                    use_wait_flag: self.use_wait_flag,
                })?
            }
        };

        config.simulate_only |= self.simulate;
        Ok(config)
    }
}

#[derive(Args)]
struct ToolArgs {
    /// iptables binary
    #[arg(long, value_name = "PATH", env = "PROXY_INIT_IPTABLES_BIN")]
    iptables: Option<String>,
    /// iptables-save binary
    #[arg(long, value_name = "PATH", env = "PROXY_INIT_IPTABLES_SAVE_BIN")]
    iptables_save: Option<String>,
    /// nsenter binary
    #[arg(long, value_name = "PATH", env = "PROXY_INIT_NSENTER_BIN")]
    nsenter: Option<String>,
}

impl ToolArgs {
    fn into_tools(self) -> Tools {
        let defaults = Tools::default();
        Tools {
            iptables: self.iptables.unwrap_or(defaults.iptables),
            iptables_save: self.iptables_save.unwrap_or(defaults.iptables_save),
            nsenter: self.nsenter.unwrap_or(defaults.nsenter),
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli.command)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            print_translation(&e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if verbose {
        Level::DEBUG
    } else if quiet {
        Level::WARN
    } else {
        Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn print_translation(e: &proxy_init::Error) {
    let translation = IptablesErrorPattern::match_error(&e.detail());
    eprintln!("{}", translation.user_message);
    for suggestion in &translation.suggestions {
        eprintln!("  - {suggestion}");
    }
    if let Some(url) = translation.help_url {
        eprintln!("See {url}");
    }
}

async fn handle_cli(command: Commands) -> proxy_init::Result<()> {
    match command {
        Commands::Apply {
            firewall,
            tools,
            audit_log,
        } => {
            let config = firewall.resolve().await?;
            let tools = tools.into_tools();
            let audit_log = audit_log.map(AuditLog::new);

            if !config.simulate_only {
                preflight(&config, &tools);
            }

            let trace_id = TraceId::generate();
            match configure_firewall(&config, &tools, trace_id.clone(), ProcessRunner).await {
                Ok(report) => {
                    print_report(&report, &config, &tools);
                    let event = AuditEvent::from_report(&report, config.net_ns.as_deref());
                    audit::record(audit_log.as_ref(), &event).await;
                }
                Err(e) => {
                    let event_type = if config.simulate_only {
                        EventType::SimulateFirewall
                    } else {
                        EventType::ConfigureFirewall
                    };
                    let event = AuditEvent::new(
                        event_type,
                        trace_id.as_str(),
                        false,
                        serde_json::json!({ "net_ns": config.net_ns }),
                        Some(e.to_string()),
                    );
                    audit::record(audit_log.as_ref(), &event).await;
                    return Err(e);
                }
            }
        }
        Commands::Plan { firewall, tools } => {
            let config = firewall.resolve().await?;
            let tools = tools.into_tools();

            let rules = RuleBuilder::new(TraceId::generate());
            // No dump: cleanup is shown in its bare form
            let transaction = compose(&config, &rules, None);
            let driver = Driver::new(DispatchOptions::from(&config), &tools, ProcessRunner);

            let mut current = None;
            for (phase, mutation) in transaction.iter() {
                if current != Some(phase) {
                    if current.is_some() {
                        end_section();
                    }
                    start_section(match phase {
                        Phase::Cleanup => "cleanup",
                        Phase::Install => "adding rules",
                    });
                    current = Some(phase);
                }
                println!("{}", driver.invocation(mutation));
            }
            end_section();
        }
        Commands::Show { netns, tools } => {
            let net_ns = match netns {
                Some(ns) => proxy_init::validators::validate_netns(&ns)
                    .map_err(|message| proxy_init::Error::validation("netNs", message))?,
                None => None,
            };
            let snapshot = show_rules(&tools.into_tools(), net_ns, ProcessRunner).await?;
            print!("{}", snapshot.text);
        }
    }
    Ok(())
}

/// Warns about conditions that will most likely make the run fail.
fn preflight(config: &FirewallConfiguration, tools: &Tools) {
    if !namespace::is_root() {
        tracing::warn!("Not running as root; iptables will likely refuse to modify the NAT table");
    }

    let mut required = vec![tools.iptables.as_str(), tools.iptables_save.as_str()];
    if config.net_ns.is_some() {
        required.push(tools.nsenter.as_str());
    }
    for binary in required {
        if !namespace::binary_exists(binary) {
            tracing::warn!("{binary} not found on PATH");
        }
    }
}

fn print_report(report: &RunReport, config: &FirewallConfiguration, tools: &Tools) {
    if report.simulated {
        let driver = Driver::new(DispatchOptions::from(config), tools, ProcessRunner);
        start_section("simulated commands");
        for (_, mutation) in report.transaction.iter() {
            println!("{}", driver.invocation(mutation));
        }
        end_section();
        return;
    }

    if let Some(before) = &report.before {
        start_section("current state");
        print!("{}", before.text);
        end_section();
    }

    if let Some(after) = &report.after {
        start_section("end state");
        print!("{}", after.text);
        end_section();
    }

    if let Some(diff) = report.diff() {
        start_section("changes");
        print!("{diff}");
        end_section();
    }

    if !report.ignored_failures.is_empty() {
        println!(
            "{} cleanup command(s) failed and were ignored",
            report.ignored_failures.len()
        );
    }
}
