//! Execution tracing and rule table snapshots
//!
//! Every rule a run creates carries the run's [`TraceId`] in its comment, so
//! stale rules left behind by earlier runs can be told apart in an
//! `iptables-save` dump. The id is the run's start time in whole seconds: two
//! runs started within the same second share an id.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt;

/// Width of the delimiter printed under a section title
pub const SECTION_WIDTH: usize = 60;

/// Identifies one execution of the tool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraceId(String);

impl TraceId {
    /// Derives an id from the current UNIX time in seconds.
    pub fn generate() -> Self {
        Self::from_timestamp(Utc::now())
    }

    /// Whole seconds of `at`; sub-second precision is dropped.
    pub fn from_timestamp(at: DateTime<Utc>) -> Self {
        Self(at.timestamp().to_string())
    }

    /// Wraps a caller-chosen id (used by tests and replays).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Captured output of an `iptables-save` dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RulesetSnapshot {
    pub text: String,
}

impl RulesetSnapshot {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// SHA-256 of the dump, hex encoded.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Lines of the dump that were written by the given run.
    pub fn rules_tagged_with<'a>(
        &'a self,
        trace_id: &'a TraceId,
    ) -> impl Iterator<Item = &'a str> {
        let suffix = format!("/{}", trace_id.as_str());
        self.text.lines().filter(move |line| {
            line.split_whitespace()
                .map(|token| token.trim_matches('"'))
                .any(|token| {
                    token.starts_with(crate::core::rules::COMMENT_NAMESPACE)
                        && token.ends_with(&suffix)
                })
        })
    }

    /// Jumps from `hook` into `target_chain` that carry nothing but an
    /// optional comment, in dump order.
    ///
    /// These are the jumps this tool installs. Rules with any other match
    /// belong to someone else and are skipped.
    pub fn saved_jumps(&self, hook: &str, target_chain: &str) -> Vec<SavedJump> {
        self.text
            .lines()
            .filter_map(|line| parse_saved_jump(line, hook, target_chain))
            .collect()
    }
}

/// A `-A <hook> ... -j <chain>` line found in a dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedJump {
    /// Comment the rule was installed with, unquoted
    pub comment: Option<String>,
}

fn parse_saved_jump(line: &str, hook: &str, target_chain: &str) -> Option<SavedJump> {
    let mut tokens = line.split_whitespace();
    if tokens.next()? != "-A" || tokens.next()? != hook {
        return None;
    }

    let mut comment = None;
    let mut jumps_to_target = false;
    while let Some(token) = tokens.next() {
        match token {
            "-m" => {
                if tokens.next()? != "comment" {
                    return None;
                }
            }
            "--comment" => comment = Some(tokens.next()?.trim_matches('"').to_string()),
            "-j" => jumps_to_target = tokens.next()? == target_chain,
            _ => return None,
        }
    }

    jumps_to_target.then_some(SavedJump { comment })
}

/// Line diff between two dumps, skipping the volatile header/footer comments
/// (`# Generated by ...`, `# Completed on ...`).
pub fn diff_snapshots(before: &RulesetSnapshot, after: &RulesetSnapshot) -> String {
    let old_text = strip_dump_comments(&before.text);
    let new_text = strip_dump_comments(&after.text);

    let diff = similar::TextDiff::from_lines(&old_text, &new_text);
    let mut out = String::new();
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            similar::ChangeTag::Delete => "- ",
            similar::ChangeTag::Insert => "+ ",
            similar::ChangeTag::Equal => continue,
        };
        out.push_str(sign);
        out.push_str(change.value());
        if change.missing_newline() {
            out.push('\n');
        }
    }
    out
}

fn strip_dump_comments(text: &str) -> String {
    text.lines()
        .filter(|line| !line.starts_with('#'))
        .fold(String::new(), |mut acc, line| {
            acc.push_str(line);
            acc.push('\n');
            acc
        })
}

/// Prints a section title followed by the delimiter line.
pub fn start_section(title: &str) {
    println!("{title}\n{}", "-".repeat(SECTION_WIDTH));
}

pub fn end_section() {
    println!("\n");
}
