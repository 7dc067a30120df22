//! Safety limits enforced before any action takes effect.
//!
//! Covers:
//! - Subject/body length ceilings for mail and postfach actions
//! - The webhook host allow-list
//! - Denylist patterns for credential-style webhook headers

use glob::{MatchOptions, Pattern};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Safety limits for action dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Maximum rendered subject length in characters (default: 200)
    #[serde(default = "default_max_subject_chars")]
    pub max_subject_chars: usize,

    /// Maximum rendered body length in characters (default: 20000)
    #[serde(default = "default_max_body_chars")]
    pub max_body_chars: usize,

    /// Hosts webhooks may reach; subdomains of an entry are allowed too.
    /// Empty means no webhook is allowed.
    #[serde(default)]
    pub webhook_allowed_domains: Vec<String>,

    /// Glob patterns for header names that must never be sent
    #[serde(default = "default_header_denylist")]
    pub header_denylist: Vec<String>,
}

fn default_max_subject_chars() -> usize {
    200
}
fn default_max_body_chars() -> usize {
    20_000
}

fn default_header_denylist() -> Vec<String> {
    [
        "authorization",
        "proxy-authorization",
        "cookie",
        "set-cookie",
        "*token*",
        "*secret*",
        "*password*",
        "*api-key*",
        "*api_key*",
        "*apikey*",
        "*credential*",
        "*auth*",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_subject_chars: default_max_subject_chars(),
            max_body_chars: default_max_body_chars(),
            webhook_allowed_domains: Vec::new(),
            header_denylist: default_header_denylist(),
        }
    }
}

impl SafetyLimits {
    /// Check if a header name matches any denylist pattern (case-insensitive)
    pub fn is_header_denylisted(&self, name: &str) -> bool {
        let options = MatchOptions {
            case_sensitive: false,
            require_literal_separator: false,
            require_literal_leading_dot: false,
        };
        let name = name.trim();
        self.header_denylist.iter().any(|pattern_str| {
            Pattern::new(pattern_str)
                .map(|pattern| pattern.matches_with(name, options))
                .unwrap_or(false)
        })
    }

    /// Reject the first credential-style header.
    pub fn validate_headers<'a, I>(&self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a String>,
    {
        for name in names {
            if self.is_header_denylisted(name) {
                return Err(EngineError::HeaderNotAllowed(name.to_ascii_lowercase()));
            }
        }
        Ok(())
    }

    /// Parse a webhook URL and check its host against the allow-list.
    pub fn check_webhook_url(&self, url: &str) -> Result<Url> {
        let parsed = Url::parse(url).map_err(|_| EngineError::Validation("webhook url is invalid".to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(EngineError::Validation("webhook url must use http or https".to_string()));
        }
        let host = parsed
            .host_str()
            .map(|h| h.trim_end_matches('.').to_ascii_lowercase())
            .ok_or_else(|| EngineError::Validation("webhook url has no host".to_string()))?;

        // No userinfo in the authority
        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(EngineError::DomainNotAllowed(host));
        }

        if self.is_host_allowed(&host) {
            Ok(parsed)
        } else {
            Err(EngineError::DomainNotAllowed(host))
        }
    }

    /// Exact match or subdomain of an allow-listed domain
    pub fn is_host_allowed(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.webhook_allowed_domains.iter().any(|domain| {
            let domain = domain.trim().trim_start_matches('.').to_ascii_lowercase();
            !domain.is_empty() && (host == domain || host.ends_with(&format!(".{}", domain)))
        })
    }

    /// Validate a rendered subject
    pub fn validate_subject(&self, subject: &str) -> Result<()> {
        let actual = subject.chars().count();
        if actual > self.max_subject_chars {
            return Err(EngineError::SubjectTooLong {
                actual,
                limit: self.max_subject_chars,
            });
        }
        Ok(())
    }

    /// Validate a rendered body
    pub fn validate_body(&self, body: &str) -> Result<()> {
        let actual = body.chars().count();
        if actual > self.max_body_chars {
            return Err(EngineError::BodyTooLong {
                actual,
                limit: self.max_body_chars,
            });
        }
        Ok(())
    }
}
