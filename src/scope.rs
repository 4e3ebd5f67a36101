use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("invalid scope pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

pub const DEFAULT_ALLOW_PATTERNS: &[&str] = &[
    r"^https://learn\.microsoft\.com/en-us/power-platform/",
    r"^https://learn\.microsoft\.com/en-us/power-apps/",
    r"^https://learn\.microsoft\.com/en-us/power-automate/",
    r"^https://learn\.microsoft\.com/en-us/power-bi/",
    r"^https://learn\.microsoft\.com/en-us/azure/",
    r"^https://learn\.microsoft\.com/en-us/sql/",
    r"^https://learn\.microsoft\.com/en-us/dotnet/",
    r"^https://learn\.microsoft\.com/en-us/microsoft-365/",
];

pub const DEFAULT_DENY_PATTERNS: &[&str] = &[
    r"/samples/",
    r"/training/",
    r"/api/",
    r"/rest/api/",
    r"/search/?(\?|$)",
    r"/browse/?(\?|$)",
    r"(?i)\.(zip|pdf|exe|msi|tar|gz|nupkg)$",
    r"(?i)\.(png|jpe?g|gif|svg|webp|ico|mp4)$",
    r"/includes/",
];

/// Allow/deny policy bounding what the crawl may visit.
#[derive(Debug, Clone)]
pub struct ScopePolicy {
    allow: Vec<Regex>,
    deny: Vec<Regex>,
}

impl ScopePolicy {
    pub fn new<A, D>(allow: &[A], deny: &[D]) -> Result<Self, ScopeError>
    where
        A: AsRef<str>,
        D: AsRef<str>,
    {
        Ok(Self {
            allow: compile(allow)?,
            deny: compile(deny)?,
        })
    }

    pub fn with_defaults() -> Result<Self, ScopeError> {
        Self::new(DEFAULT_ALLOW_PATTERNS, DEFAULT_DENY_PATTERNS)
    }

    /// Anchor links, then the deny list, then the allow list. A deny match
    /// wins over any allow match.
    pub fn allows(&self, raw: &str) -> bool {
        if raw.contains('#') {
            return false;
        }
        if self.deny.iter().any(|re| re.is_match(raw)) {
            return false;
        }
        self.allow.iter().any(|re| re.is_match(raw))
    }
}

fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Regex>, ScopeError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p.as_ref()).map_err(|source| ScopeError::Pattern {
                pattern: p.as_ref().to_string(),
                source,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_scope_accepts_product_sections() {
        let scope = ScopePolicy::with_defaults().unwrap();
        assert!(scope.allows("https://learn.microsoft.com/en-us/azure/storage/common/storage-introduction"));
        assert!(scope.allows("https://learn.microsoft.com/en-us/power-platform/power-fx/overview"));
        assert!(!scope.allows("https://learn.microsoft.com/en-us/windows/whats-new"));
        assert!(!scope.allows("https://learn.microsoft.com/de-de/azure/storage/"));
        assert!(!scope.allows("https://example.com/en-us/azure/"));
    }

    #[test]
    fn fragments_are_rejected_even_when_in_scope() {
        let scope = ScopePolicy::with_defaults().unwrap();
        assert!(!scope.allows("https://learn.microsoft.com/en-us/azure/storage/#next-steps"));
        assert!(!scope.allows("https://learn.microsoft.com/en-us/azure/#"));
    }

    #[test]
    fn deny_list_wins_over_allow_list() {
        let scope = ScopePolicy::with_defaults().unwrap();
        for url in [
            "https://learn.microsoft.com/en-us/azure/samples/browse/",
            "https://learn.microsoft.com/en-us/azure/training/modules/intro",
            "https://learn.microsoft.com/en-us/dotnet/api/system.string",
            "https://learn.microsoft.com/en-us/azure/search",
            "https://learn.microsoft.com/en-us/azure/architecture/browse/",
            "https://learn.microsoft.com/en-us/azure/media/diagram.PNG",
            "https://learn.microsoft.com/en-us/sql/downloads/tools.zip",
            "https://learn.microsoft.com/en-us/azure/includes/header",
        ] {
            assert!(!scope.allows(url), "{url}");
        }
        assert!(scope.allows("https://learn.microsoft.com/en-us/azure/search-service/overview"));
    }

    #[test]
    fn bad_patterns_are_reported() {
        let err = ScopePolicy::new(&["("], &[] as &[&str]).unwrap_err();
        assert!(err.to_string().contains("invalid scope pattern"));
    }
}
