//! Network namespace entry and tool discovery
//!
//! When a target namespace is configured, every command is run through
//! `nsenter --net <ns>` instead of in the caller's own namespace:
//!
//! ```text
//! iptables -t nat -N PROXY_INIT_OUTPUT ...
//!   becomes
//! nsenter --net /proc/4242/ns/net iptables -t nat -N PROXY_INIT_OUTPUT ...
//! ```
//!
//! Arguments are never passed through a shell.
//!
//! # Example
//!
//! ```
//! use proxy_init::namespace::wrap_in_namespace;
//!
//! let (program, args) = wrap_in_namespace(
//!     "nsenter",
//!     "/proc/1/ns/net",
//!     "iptables-save",
//!     Vec::new(),
//! );
//! assert_eq!(program, "nsenter");
//! assert_eq!(args, ["--net", "/proc/1/ns/net", "iptables-save"]);
//! ```

use std::path::PathBuf;

/// Prefixes `program args...` with `nsenter --net <net_ns>`.
pub fn wrap_in_namespace(
    nsenter: &str,
    net_ns: &str,
    program: &str,
    args: Vec<String>,
) -> (String, Vec<String>) {
    let mut wrapped = Vec::with_capacity(args.len() + 3);
    wrapped.push("--net".to_string());
    wrapped.push(net_ns.to_string());
    wrapped.push(program.to_string());
    wrapped.extend(args);
    (nsenter.to_string(), wrapped)
}

/// Resolves a binary the way `execvp` would.
///
/// Names containing a `/` are taken as paths.
pub fn find_binary(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return path.is_file().then_some(path);
    }

    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths).find_map(|dir| {
            let full_path = dir.join(name);
            if full_path.is_file() {
                Some(full_path)
            } else {
                None
            }
        })
    })
}

/// Checks if a binary exists in PATH
pub fn binary_exists(name: &str) -> bool {
    find_binary(name).is_some()
}

/// Whether the process runs with an effective uid of 0.
///
/// Root is not strictly required (CAP_NET_ADMIN is enough), so callers only warn.
pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}
