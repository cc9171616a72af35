//! Shared test utilities for core module tests
//!
//! Provides a recording [`CommandRunner`] so driver tests never touch the
//! real rule table. This module is only compiled in test mode.

use crate::core::driver::{CommandOutput, CommandRunner, Invocation};
use crate::core::firewall::FirewallConfiguration;

/// What the recording runner returns for `iptables-save`
pub const SAMPLE_DUMP: &str = "*nat
:PREROUTING ACCEPT [0:0]
:INPUT ACCEPT [0:0]
:OUTPUT ACCEPT [0:0]
:POSTROUTING ACCEPT [0:0]
COMMIT
";

/// Records every invocation and fails the ones matching a scripted pattern.
///
/// Patterns are matched against the rendered command line
/// (`program arg1 arg2 ...`).
///
/// # Example
///
/// ```ignore
/// let mut runner = RecordingRunner::default()
///     .fail_on("-N PROXY_INIT_OUTPUT", "iptables: Chain already exists.");
/// configure_firewall(&config, &tools, trace, &mut runner).await.unwrap_err();
/// assert_eq!(runner.calls.len(), 9);
/// ```
#[derive(Debug, Default)]
pub struct RecordingRunner {
    pub calls: Vec<Invocation>,
    failures: Vec<Failure>,
    missing: Vec<String>,
    dump: Option<String>,
}

#[derive(Debug)]
struct Failure {
    pattern: String,
    /// Matching calls to let through before failing
    skip: usize,
    seen: usize,
    stderr: String,
}

impl RecordingRunner {
    /// Fails every call whose command line contains `pattern`.
    pub fn fail_on(self, pattern: &str, stderr: &str) -> Self {
        self.fail_after(pattern, 0, stderr)
    }

    /// Lets the first `skip` matching calls succeed, then fails the rest.
    pub fn fail_after(mut self, pattern: &str, skip: usize, stderr: &str) -> Self {
        self.failures.push(Failure {
            pattern: pattern.to_string(),
            skip,
            seen: 0,
            stderr: stderr.to_string(),
        });
        self
    }

    /// `iptables-save` prints `dump` instead of [`SAMPLE_DUMP`].
    pub fn with_dump(mut self, dump: &str) -> Self {
        self.dump = Some(dump.to_string());
        self
    }

    /// Calls to `program` fail to spawn with `NotFound`.
    pub fn missing(mut self, program: &str) -> Self {
        self.missing.push(program.to_string());
        self
    }
}

impl CommandRunner for RecordingRunner {
    async fn run(&mut self, invocation: &Invocation) -> std::io::Result<CommandOutput> {
        self.calls.push(invocation.clone());

        if self.missing.contains(&invocation.program) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "No such file or directory",
            ));
        }

        let line = invocation.to_string();
        for failure in &mut self.failures {
            if line.contains(&failure.pattern) {
                failure.seen += 1;
                if failure.seen > failure.skip {
                    return Ok(CommandOutput {
                        success: false,
                        exit_code: Some(1),
                        stdout: String::new(),
                        stderr: failure.stderr.clone(),
                    });
                }
            }
        }

        let stdout = if line.contains("iptables-save") {
            self.dump.as_deref().unwrap_or(SAMPLE_DUMP).to_string()
        } else {
            String::new()
        };
        Ok(CommandOutput {
            success: true,
            exit_code: Some(0),
            stdout,
            stderr: String::new(),
        })
    }
}

/// A configuration exercising every outbound rule.
pub fn test_config() -> FirewallConfiguration {
    FirewallConfiguration {
        inbound_ports_to_ignore: vec![4190, 4191],
        outbound_ports_to_ignore: vec![443],
        proxy_uid: Some(2102),
        ..FirewallConfiguration::new(4143, 4140)
    }
}
