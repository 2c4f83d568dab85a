//! Output sanitization for text captured from sandboxes.
//!
//! Everything a learner sees (validation output, terminal data) passes
//! through here first. Strips infrastructure artifacts and secret-looking
//! tokens, then enforces a hard byte cap so a runaway command cannot flood
//! the transport.

use once_cell::sync::Lazy;
use regex::Regex;

/// Marker substituted for every redacted match.
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Hard cap on sanitized output size.
pub const MAX_OUTPUT_BYTES: usize = 64 * 1024;

const TRUNCATION_NOTICE: &str = "\n... [output truncated at 64 KB]";

static SENSITIVE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // Private container-network IPs (172.16.0.0/12)
        r"\b172\.(?:1[6-9]|2\d|3[01])\.\d{1,3}\.\d{1,3}\b",
        // Engine-internal hostnames (12 hex chars + .internal)
        r"(?i)\b[a-f0-9]{12}\.internal\b",
        // Runtime socket path
        r"/var/run/docker\.sock",
        // Secret-looking env assignments
        r"(?i)(?:API_KEY|SECRET|TOKEN|PASSWORD|CREDENTIAL)=[^\s]+",
        // Engine storage paths carrying container ids
        r"/var/lib/docker/[^\s]+",
        // Host home directories
        r"/home/[a-zA-Z0-9_-]+/",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("sanitizer pattern must compile"))
    .collect()
});

/// Sanitize captured sandbox output.
///
/// Replaces sensitive matches with [`REDACTION_MARKER`] and truncates the
/// result at [`MAX_OUTPUT_BYTES`] (on a char boundary), appending a
/// truncation notice when the cap is hit.
pub fn sanitize_output(raw: &str) -> String {
    let mut output = raw.to_string();
    for pattern in SENSITIVE_PATTERNS.iter() {
        output = pattern.replace_all(&output, REDACTION_MARKER).into_owned();
    }

    if output.len() > MAX_OUTPUT_BYTES {
        let mut cut = MAX_OUTPUT_BYTES;
        while !output.is_char_boundary(cut) {
            cut -= 1;
        }
        output.truncate(cut);
        output.push_str(TRUNCATION_NOTICE);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_private_network_ips() {
        let out = sanitize_output("connected to 172.17.0.2 port 80");
        assert_eq!(out, format!("connected to {REDACTION_MARKER} port 80"));
        // 172.15.x.x is outside the private range and must survive
        assert_eq!(sanitize_output("10 -> 172.15.0.1"), "10 -> 172.15.0.1");
    }

    #[test]
    fn redacts_secret_assignments() {
        let out = sanitize_output("export API_KEY=abc123 and SECRET=hunter2");
        assert!(!out.contains("abc123"));
        assert!(!out.contains("hunter2"));
        assert_eq!(out.matches(REDACTION_MARKER).count(), 2);
    }

    #[test]
    fn redacts_engine_paths_and_hostnames() {
        let out = sanitize_output(
            "socket /var/run/docker.sock host 0123456789ab.internal layer /var/lib/docker/overlay2/x",
        );
        assert_eq!(out.matches(REDACTION_MARKER).count(), 3);
    }

    #[test]
    fn redacts_home_directories() {
        let out = sanitize_output("found /home/alice/notes.txt");
        assert!(out.starts_with(&format!("found {REDACTION_MARKER}")));
    }

    #[test]
    fn truncates_oversized_output() {
        let big = "x".repeat(MAX_OUTPUT_BYTES + 100);
        let out = sanitize_output(&big);
        assert!(out.len() < big.len());
        assert!(out.ends_with(TRUNCATION_NOTICE));
    }

    #[test]
    fn small_clean_output_is_unchanged() {
        assert_eq!(sanitize_output("hello world\n"), "hello world\n");
    }
}
