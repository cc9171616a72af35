//! Input validation and sanitization functions for proxy-init
//!
//! The external configuration carries plain integers and strings; these
//! helpers turn them into the typed values the rule builder accepts.

/// Longest comment iptables accepts (`XT_MAX_COMMENT_LEN - 1`)
pub const MAX_COMMENT_LEN: usize = 255;

/// Label budget inside a comment; leaves room for the namespace and trace id
pub const MAX_LABEL_LEN: usize = 64;

/// Sanitizes a label for safe use in iptables comments.
///
/// Removes control characters, quotes, slashes and shell metacharacters.
/// Slashes are dropped because they separate the comment's segments.
///
/// # Examples
///
/// ```
/// use proxy_init::validators::sanitize_label;
///
/// assert_eq!(sanitize_label("ignore-port-22"), "ignore-port-22");
///
/// let safe = sanitize_label("bad\n\"label\"/x");
/// assert_eq!(safe, "badlabelx");
/// ```
pub fn sanitize_label(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
        .take(MAX_LABEL_LEN)
        .collect()
}

/// Validates a port from an ignore or redirect list.
///
/// # Errors
///
/// Returns `Err` if the value is outside 0-65535.
pub fn validate_port(value: i64) -> Result<u16, String> {
    u16::try_from(value).map_err(|_| format!("Port {value} must be between 0 and 65535"))
}

/// Validates a port the proxy listens on.
///
/// # Errors
///
/// Returns `Err` if the value is not between 1 and 65535.
pub fn validate_proxy_port(value: i64) -> Result<u16, String> {
    match validate_port(value) {
        Ok(0) | Err(_) => Err(format!("Proxy port {value} must be between 1 and 65535")),
        Ok(port) => Ok(port),
    }
}

/// Interprets the proxy uid; zero or negative means no exemption.
///
/// # Errors
///
/// Returns `Err` if the value does not fit a uid.
pub fn validate_uid(value: i64) -> Result<Option<u32>, String> {
    if value <= 0 {
        return Ok(None);
    }
    u32::try_from(value)
        .map(Some)
        .map_err(|_| format!("UID {value} is out of range"))
}

/// Validates a network namespace reference; empty means the current namespace.
///
/// # Errors
///
/// Returns `Err` if the value contains NUL bytes or starts with `-`
/// (it would be read as an nsenter option).
pub fn validate_netns(value: &str) -> Result<Option<String>, String> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    if value.contains('\0') {
        return Err("Namespace contains a NUL byte".to_string());
    }
    if value.starts_with('-') {
        return Err("Namespace must be a path, not an option".to_string());
    }
    Ok(Some(value.to_string()))
}

/// Validates a whole port list, reporting the first bad entry.
///
/// # Errors
///
/// Returns `Err` if any entry is outside 0-65535.
pub fn validate_port_list(values: &[i64]) -> Result<Vec<u16>, String> {
    values.iter().map(|&v| validate_port(v)).collect()
}
