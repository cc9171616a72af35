use thiserror::Error;

/// Core error types for proxy-init
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration value rejected
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// The tool could not be started at all (missing binary, not executable)
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The tool ran and reported failure
    #[error("`{command}` failed ({}): {output}", describe_exit(.exit_code))]
    Command {
        command: String,
        exit_code: Option<i32>,
        output: String,
    },
}

#[allow(clippy::ref_option)]
fn describe_exit(code: &Option<i32>) -> String {
    code.map_or_else(|| "killed by signal".to_string(), |c| format!("exit code {c}"))
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Text to match against [`IptablesErrorPattern`]
    pub fn detail(&self) -> String {
        match self {
            Error::Spawn { source, .. } => source.to_string(),
            Error::Command { output, .. } => output.clone(),
            other => other.to_string(),
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub help_url: Option<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
            help_url: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_help(mut self, url: impl Into<String>) -> Self {
        self.help_url = Some(url.into());
        self
    }
}

/// Database of iptables/nsenter error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches an error message against known patterns and returns an
    /// operator-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        // xtables lock held by another writer
        if lower.contains("xtables lock")
            || lower.contains("resource temporarily unavailable")
            || lower.contains("another app is currently holding")
        {
            return ErrorTranslation::new("The iptables lock is held by another process")
                .with_suggestion("Re-run with --use-wait-flag so iptables waits for the lock")
                .with_suggestion("Check for other agents editing iptables in this namespace");
        }

        // Permission errors
        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new("Insufficient permissions to modify the NAT table")
                .with_suggestion("Run as root or grant the container CAP_NET_ADMIN")
                .with_suggestion("Entering another network namespace also requires CAP_SYS_ADMIN")
                .with_help("https://man7.org/linux/man-pages/man7/capabilities.7.html");
        }

        // Kernel match/target extension unavailable
        if lower.contains("couldn't load match") || lower.contains("couldn't load target") {
            return ErrorTranslation::new("A required iptables extension could not be loaded")
                .with_suggestion("The owner, comment and REDIRECT extensions must be available")
                .with_suggestion(
                    "Check kernel modules: lsmod | grep -E 'xt_owner|xt_comment|xt_REDIRECT'",
                )
                .with_help("https://man7.org/linux/man-pages/man8/iptables-extensions.8.html");
        }

        // Namespace path given to nsenter does not exist
        if lower.contains("nsenter") && lower.contains("no such file") {
            return ErrorTranslation::new("Network namespace not found")
                .with_suggestion(
                    "Check the --netns path, e.g. /proc/<pid>/ns/net or /var/run/netns/<name>",
                )
                .with_suggestion("The pod sandbox may have been torn down");
        }

        // Missing binaries
        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new(
                "iptables (or nsenter) is not installed or not found in PATH",
            )
                .with_suggestion("Install iptables: apk add iptables  (Alpine)")
                .with_suggestion("Or: apt install iptables  (Debian/Ubuntu)")
                .with_suggestion(
                    "Or point --iptables / --iptables-save / --nsenter at the binaries",
                );
        }

        // Chain left over from an interrupted run
        if lower.contains("chain already exists") {
            return ErrorTranslation::new("A proxy-init chain already exists")
                .with_suggestion("A previous run's chains could not be removed during cleanup")
                .with_suggestion(
                    "Remove the jump rules referencing PROXY_INIT_OUTPUT / PROXY_INIT_REDIRECT \
                     and re-run",
                );
        }

        // Missing chain/target/match
        if lower.contains("no chain/target/match by that name")
            || lower.contains("chain does not exist")
        {
            return ErrorTranslation::new("Firewall chain not found")
                .with_suggestion("Ensure the chain exists before adding rules to it")
                .with_suggestion("Check that the nat table is available: iptables -t nat -L");
        }

        // Unknown option (old or nft-backed iptables without the expected flags)
        if lower.contains("unknown option") || lower.contains("bad argument") {
            return ErrorTranslation::new("iptables rejected the command line")
                .with_suggestion("Check the iptables version: iptables --version")
                .with_suggestion("Older releases do not support -w; drop --use-wait-flag");
        }

        // Generic fallback
        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Inspect the current rules: iptables-save -t nat")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
