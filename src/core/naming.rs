//! Deterministic addressing of monitoring endpoints.
//!
//! Invocations share no state, so the only way a later phase can find the
//! endpoint an earlier phase created is to derive the same slug from the same
//! inputs. [`slug`] is therefore a pure function of the job id, the optional
//! target and the host identity: no clock, no randomness, no process state.

use std::fmt;

use crate::core::host::HostIdentity;
use crate::core::models::BackupTarget;

/// Room left for `-` plus the digest within the service's 100 char limit.
const MAX_STEM_LEN: usize = 90;
const DIGEST_LEN: usize = 8;

/// Identifier of one monitoring endpoint. Always matches `^[a-z0-9_-]+$`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slug(String);

impl Slug {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wrap an already-derived slug, e.g. one read back from the service.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl fmt::Display for Slug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Slug {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derive the slug of a job (`target = None`) or of one of its targets.
///
/// The readable stem is `<job>[-<vmid>-<vmtype>] <node>.<cluster>.<domain>`
/// normalized to the service's slug alphabet. A short BLAKE3 digest of the
/// raw inputs is appended so that inputs which normalize to the same stem
/// still get distinct slugs.
pub fn slug(host: &HostIdentity, job_id: &str, target: Option<&BackupTarget>) -> Slug {
    let stem = match target {
        None => format!("{} {}", job_id, host.suffix()),
        Some(t) => format!("{}-{}-{} {}", job_id, t.vmid, t.vmtype, host.suffix()),
    };

    let mut normalized = normalize(&stem);
    normalized.truncate(MAX_STEM_LEN);

    Slug(format!("{}-{}", normalized, digest(host, job_id, target)))
}

/// Lowercase; space to `__`; `.` to `-`; anything else outside
/// `[a-z0-9_-]` to `_`. Output is pure ASCII.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            ' ' => out.push_str("__"),
            '.' => out.push('-'),
            c if c.is_ascii_alphanumeric() || c == '-' || c == '_' => {
                out.push(c.to_ascii_lowercase())
            }
            _ => out.push('_'),
        }
    }
    out
}

fn digest(host: &HostIdentity, job_id: &str, target: Option<&BackupTarget>) -> String {
    let kind = if target.is_some() { "target" } else { "job" };
    let (vmid, vmtype) = target
        .map(|t| (t.vmid.as_str(), t.vmtype.as_str()))
        .unwrap_or(("", ""));

    let mut hasher = blake3::Hasher::new();
    for part in [
        kind,
        job_id,
        vmid,
        vmtype,
        host.node.as_str(),
        host.cluster.as_str(),
        host.domain.as_str(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update(b"\0");
    }
    hasher.finalize().to_hex()[..DIGEST_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> HostIdentity {
        HostIdentity::new("pve1", "homelab", "example.com")
    }

    fn is_valid(slug: &Slug) -> bool {
        !slug.as_str().is_empty()
            && slug.as_str().len() <= 100
            && slug
                .as_str()
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    }

    #[test]
    fn test_job_slug_shape() {
        let slug = slug(&host(), "job", None);
        assert!(
            slug.as_str().starts_with("job__pve1-homelab-example-com-"),
            "{}",
            slug
        );
        assert_eq!(
            slug.as_str().len(),
            "job__pve1-homelab-example-com-".len() + DIGEST_LEN
        );
        assert!(is_valid(&slug));
    }

    #[test]
    fn test_target_slug_shape() {
        let target = BackupTarget::new("101", "qemu");
        let slug = slug(&host(), "job", Some(&target));
        assert!(
            slug.as_str()
                .starts_with("job-101-qemu__pve1-homelab-example-com-"),
            "{}",
            slug
        );
        assert!(is_valid(&slug));
    }

    #[test]
    fn test_slug_is_deterministic() {
        let target = BackupTarget::new("101", "lxc");
        let a = slug(&host(), "nightly", Some(&target));
        let b = slug(&host(), "nightly", Some(&target.clone()));
        let c = slug(&HostIdentity::new("PVE1", "homelab", "example.com"), "nightly", Some(&target));
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_distinct_inputs_get_distinct_slugs() {
        let h = host();
        let t1 = BackupTarget::new("101", "qemu");
        let t2 = BackupTarget::new("102", "qemu");

        let job = slug(&h, "job", None);
        let s1 = slug(&h, "job", Some(&t1));
        let s2 = slug(&h, "job", Some(&t2));
        let other_job = slug(&h, "weekly", Some(&t1));
        let other_node = slug(&HostIdentity::new("pve2", "homelab", "example.com"), "job", Some(&t1));

        let all = [&job, &s1, &s2, &other_job, &other_node];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_normalization_collisions_are_disambiguated() {
        // Both stems normalize to "a-b__..." but the raw inputs differ.
        let a = slug(&host(), "a.b", None);
        let b = slug(&host(), "a-b", None);
        assert_ne!(a, b);
        assert_eq!(
            &a.as_str()[..a.as_str().len() - DIGEST_LEN],
            &b.as_str()[..b.as_str().len() - DIGEST_LEN]
        );
    }

    #[test]
    fn test_long_inputs_are_truncated() {
        let job_id = "x".repeat(300);
        let slug = slug(&host(), &job_id, Some(&BackupTarget::new("100", "qemu")));
        assert_eq!(slug.as_str().len(), MAX_STEM_LEN + 1 + DIGEST_LEN);
        assert!(is_valid(&slug));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("Job 1.2"), "job__1-2");
        assert_eq!(normalize("büro/x"), "b_ro_x");
        assert_eq!(normalize("a_b-c"), "a_b-c");
    }
}
