use std::fmt;

use crate::core::naming::Slug;

/// Space separated `key=value` tags attached to an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tags(Vec<String>);

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `key=value`. Blank values are skipped; whitespace inside the value
    /// becomes `_` since the service splits tags on spaces.
    pub fn with(mut self, key: &str, value: impl AsRef<str>) -> Self {
        let value = value.as_ref().trim();
        if key.is_empty() || value.is_empty() {
            return self;
        }

        let tag = format!("{}={}", clean(key), clean(value));
        if !self.0.contains(&tag) {
            self.0.push(tag);
        }
        self
    }

    pub fn with_opt(self, key: &str, value: Option<&str>) -> Self {
        match value {
            Some(v) => self.with(key, v),
            None => self,
        }
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.iter().any(|t| t == tag)
    }

    /// Value of `key` from a tag string as returned by the service.
    pub fn lookup<'a>(tags: &'a str, key: &str) -> Option<&'a str> {
        tags.split_whitespace()
            .filter_map(|t| t.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}

impl fmt::Display for Tags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

/// Tag carried by every target endpoint of a job; `job-end` lists by it.
pub fn job_tag(job: &Slug) -> String {
    format!("job={}", job)
}

fn clean(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_format() {
        let tags = Tags::new()
            .with("cluster", "HomeLab")
            .with("storage", "  ")
            .with("hostname", "web server 01")
            .with_opt("mode", Some("snapshot"))
            .with_opt("vmid", None);

        assert_eq!(
            tags.to_string(),
            "cluster=homelab hostname=web_server_01 mode=snapshot"
        );
    }

    #[test]
    fn test_duplicate_tags_collapse() {
        let tags = Tags::new().with("role", "job").with("role", "JOB");
        assert_eq!(tags.to_string(), "role=job");
    }

    #[test]
    fn test_lookup() {
        let raw = "role=target vmid=101 vmtype=qemu";
        assert_eq!(Tags::lookup(raw, "vmid"), Some("101"));
        assert_eq!(Tags::lookup(raw, "vmtype"), Some("qemu"));
        assert_eq!(Tags::lookup(raw, "node"), None);
    }

    #[test]
    fn test_job_tag() {
        let slug = Slug::from_raw("job__pve1-abcdef12");
        let tags = Tags::new().with("job", slug.as_str());
        assert!(tags.contains(&job_tag(&slug)));
    }
}
