//! Domain policy for navigation targets.

use url::Url;

/// Deny-list and allow-list of hosts. A listed domain also covers its
/// subdomains.
#[derive(Debug, Clone, Default)]
pub struct DomainPolicy {
    allowed: Vec<String>,
    denied: Vec<String>,
}

impl DomainPolicy {
    pub fn new(allowed: &[String], denied: &[String]) -> Self {
        Self {
            allowed: allowed.iter().map(|d| normalize(d)).collect(),
            denied: denied.iter().map(|d| normalize(d)).collect(),
        }
    }

    /// Check a navigation target. Any deny-list match blocks; a non-empty
    /// allow-list must then match. The error is a human-readable reason.
    pub fn check(&self, target: &str) -> Result<(), String> {
        let url = Url::parse(target).map_err(|e| format!("invalid url '{target}': {e}"))?;
        let host = url
            .host_str()
            .map(normalize)
            .ok_or_else(|| format!("url '{target}' has no host"))?;

        if let Some(rule) = self.denied.iter().find(|d| matches_domain(&host, d)) {
            return Err(format!("{host} is denied by rule '{rule}'"));
        }
        if !self.allowed.is_empty() && !self.allowed.iter().any(|d| matches_domain(&host, d)) {
            return Err(format!("{host} is not in the allowed domains"));
        }
        Ok(())
    }
}

fn normalize(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn matches_domain(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}
