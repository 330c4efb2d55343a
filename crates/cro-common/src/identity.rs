//! Deterministic external identities
//!
//! External resources are named purely from the request's namespace and name
//! so that a pass interrupted after a create call rediscovers the resource on
//! the next pass instead of creating a second one.

use std::fmt::Write;

/// Maximum length of an ElastiCache replication group id
pub const MAX_REPLICATION_GROUP_ID_LEN: usize = 40;

/// Maximum length of an S3 bucket name
pub const MAX_BUCKET_NAME_LEN: usize = 63;

/// Prefix used when a sanitized identity would not start with a letter
const LETTER_PREFIX: &str = "cro-";

/// Hex chars of hash appended when an identity is truncated
const HASH_SUFFIX_LEN: usize = 8;

/// Compute a short deterministic hash of the input, returning 8 hex chars.
///
/// Uses truncated SHA-256 so the value is stable across toolchains.
pub fn short_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..HASH_SUFFIX_LEN / 2]
        .iter()
        .fold(String::with_capacity(HASH_SUFFIX_LEN), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Derive an external identity for `namespace/name` of at most `max_len` chars.
///
/// The result is lowercase alphanumeric with single hyphens, starts with a
/// letter and never ends with a hyphen. The plain `{namespace}-{name}` join is
/// used only when it can be split back into its parts: the namespace has no
/// hyphen, starts with a letter and neither part needed rewriting. Every other
/// identity, and any identity that would exceed `max_len`, ends in a hash of
/// the full `namespace/name` so distinct requests never share one.
pub fn external_identity(namespace: &str, name: &str, max_len: usize) -> String {
    let mut id = sanitize(&format!("{namespace}-{name}"));
    if !id.starts_with(|c: char| c.is_ascii_lowercase()) {
        id.insert_str(0, LETTER_PREFIX);
    }

    if id.len() <= max_len && is_reversible_join(namespace, name) {
        return id;
    }

    let keep = max_len.saturating_sub(HASH_SUFFIX_LEN + 1);
    let mut truncated: String = id.chars().take(keep).collect();
    while truncated.ends_with('-') {
        truncated.pop();
    }
    format!("{}-{}", truncated, short_hash(&format!("{namespace}/{name}")))
}

/// Replication group id for a request
pub fn replication_group_id(namespace: &str, name: &str) -> String {
    external_identity(namespace, name, MAX_REPLICATION_GROUP_ID_LEN)
}

/// Bucket name for a request
pub fn bucket_name(namespace: &str, name: &str) -> String {
    external_identity(namespace, name, MAX_BUCKET_NAME_LEN)
}

/// Whether `{namespace}-{name}` maps back to exactly one request
fn is_reversible_join(namespace: &str, name: &str) -> bool {
    namespace.starts_with(|c: char| c.is_ascii_lowercase())
        && namespace
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        && !name.is_empty()
        && sanitize(name) == name
}

fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        let c = c.to_ascii_lowercase();
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if c == '-' && (out.is_empty() || out.ends_with('-')) {
            continue;
        }
        out.push(c);
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_well_formed(id: &str) -> bool {
        id.starts_with(|c: char| c.is_ascii_lowercase())
            && !id.ends_with('-')
            && !id.contains("--")
            && id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    }

    #[test]
    fn short_names_pass_through() {
        assert_eq!(replication_group_id("payments", "cache"), "payments-cache");
        assert_eq!(bucket_name("payments", "nightly-backups"), "payments-nightly-backups");
    }

    #[test]
    fn same_input_same_identity() {
        assert_eq!(
            replication_group_id("ns", "my.Cache_01"),
            replication_group_id("ns", "my.Cache_01")
        );
    }

    #[test]
    fn invalid_chars_are_replaced_and_hashed() {
        let id = replication_group_id("Team_A", "my..cache");
        assert!(id.starts_with("team-a-my-cache-"));
        assert!(id.ends_with(&short_hash("Team_A/my..cache")));
        assert!(is_well_formed(&id));
    }

    #[test]
    fn hyphenated_namespace_and_name_do_not_share_a_group() {
        let first = replication_group_id("team-a", "cache");
        let second = replication_group_id("team", "a-cache");
        assert_ne!(first, second);
        assert_eq!(second, "team-a-cache");
        assert!(first.ends_with(&short_hash("team-a/cache")));
        assert!(is_well_formed(&first));
        assert!(first.len() <= MAX_REPLICATION_GROUP_ID_LEN);
    }

    #[test]
    fn rewritten_names_do_not_share_a_bucket() {
        let dotted = bucket_name("team-a", "my.data");
        let hyphenated = bucket_name("team-a", "my-data");
        assert_ne!(dotted, hyphenated);
        assert!(is_well_formed(&dotted));
        assert!(is_well_formed(&hyphenated));

        // Same check with a namespace that would otherwise pass through
        assert_ne!(bucket_name("team", "my.data"), bucket_name("team", "my-data"));
        assert_eq!(bucket_name("team", "my-data"), "team-my-data");
    }

    #[test]
    fn identity_starts_with_letter() {
        let id = bucket_name("1team", "x");
        assert!(id.starts_with("cro-1team-x-"));
        assert_ne!(id, bucket_name("cro", "1team-x"));
        assert!(is_well_formed(&id));
    }

    #[test]
    fn long_identities_are_truncated_with_hash() {
        let name = "a-really-long-request-name-that-goes-on-and-on";
        let id = replication_group_id("production-namespace", name);
        assert_eq!(id.len(), MAX_REPLICATION_GROUP_ID_LEN);
        assert!(is_well_formed(&id));
        assert!(id.ends_with(&short_hash(&format!("production-namespace/{name}"))));

        let other = replication_group_id("production-namespace", &format!("{name}-2"));
        assert_ne!(id, other);
    }

    #[test]
    fn short_hash_is_eight_hex_chars() {
        let h = short_hash("team-a/cache");
        assert_eq!(h.len(), 8);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
