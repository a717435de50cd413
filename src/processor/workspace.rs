//! Canonical workspace id derivation (§4.F step 2).

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

pub const UNASSOCIATED: &str = "_unassociated";

static GIT_REMOTE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:git@|https?://|ssh://(?:git@)?)([^/:]+)[:/](.+?)(?:\.git)?/?$").unwrap()
});

/// Normalize a client-supplied `workspace_id` into a stable `canonical_id`.
/// Prefers `host/owner/repo` parsed from a git remote; falls back to a hash
/// of the raw identifier; an empty identifier becomes the unassociated
/// sentinel (§3 Workspace invariants).
pub fn derive_canonical_id(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return UNASSOCIATED.to_string();
    }
    if let Some(caps) = GIT_REMOTE_RE.captures(raw) {
        let host = caps.get(1).unwrap().as_str().to_lowercase();
        let path = caps.get(2).unwrap().as_str().trim_end_matches(".git");
        return format!("{host}/{path}");
    }
    // Already host/owner/repo shaped (no scheme, contains at least one slash).
    if raw.contains('/') && !raw.contains(' ') {
        return raw.to_lowercase();
    }
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    format!("local:{}", hex::encode(hasher.finalize()))
}

/// Trailing path segment used as the initial `display_name` (§4.F step 2).
pub fn display_name_from_canonical(canonical_id: &str) -> String {
    canonical_id
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(canonical_id)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_remote_normalizes() {
        assert_eq!(
            derive_canonical_id("https://github.com/u/r.git"),
            "github.com/u/r"
        );
    }

    #[test]
    fn ssh_remote_normalizes() {
        assert_eq!(derive_canonical_id("git@github.com:u/r.git"), "github.com/u/r");
    }

    #[test]
    fn already_canonical_passes_through_lowercased() {
        assert_eq!(derive_canonical_id("GitHub.com/U/R"), "github.com/u/r");
    }

    #[test]
    fn empty_is_unassociated() {
        assert_eq!(derive_canonical_id(""), UNASSOCIATED);
    }

    #[test]
    fn opaque_identifier_hashes_to_local() {
        let id = derive_canonical_id("my workspace thing");
        assert!(id.starts_with("local:"));
    }

    #[test]
    fn display_name_takes_trailing_segment() {
        assert_eq!(display_name_from_canonical("github.com/u/r"), "r");
    }
}
