use learntrail_schemas::Observation;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::enrich::url_host;

/// Allow-list gate applied before classification.
///
/// Fail-closed: an empty whitelist rejects everything, callers must seed it to
/// enable tracking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Whitelist {
    apps: Vec<String>,
    domains: Vec<String>,
}

impl Whitelist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_lists(apps: &[String], domains: &[String]) -> Self {
        let mut whitelist = Self::new();
        for app in apps {
            whitelist.add_app(app);
        }
        for domain in domains {
            whitelist.add_domain(domain);
        }
        whitelist
    }

    pub fn apps(&self) -> &[String] {
        &self.apps
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty() && self.domains.is_empty()
    }

    /// Returns true when the domain was inserted, false if it was already present.
    pub fn add_domain(&mut self, raw: &str) -> bool {
        let domain = normalize_domain(raw);
        if domain.is_empty() || self.domains.contains(&domain) {
            return false;
        }
        self.domains.push(domain);
        true
    }

    pub fn remove_domain(&mut self, raw: &str) -> bool {
        let domain = normalize_domain(raw);
        let before = self.domains.len();
        self.domains.retain(|d| *d != domain);
        before != self.domains.len()
    }

    pub fn add_app(&mut self, raw: &str) -> bool {
        let app = raw.trim().to_lowercase();
        if app.is_empty() || self.apps.contains(&app) {
            return false;
        }
        self.apps.push(app);
        true
    }

    pub fn remove_app(&mut self, raw: &str) -> bool {
        let app = raw.trim().to_lowercase();
        let before = self.apps.len();
        self.apps.retain(|a| *a != app);
        before != self.apps.len()
    }

    pub fn check(&self, observation: &Observation) -> bool {
        self.check_parts(
            &observation.app_name,
            observation.url.as_deref(),
            &observation.window_title,
        )
    }

    pub fn check_parts(&self, app_name: &str, url: Option<&str>, window_title: &str) -> bool {
        if self.is_empty() {
            return false;
        }

        let app = app_name.trim().to_lowercase();
        if !app.is_empty()
            && self
                .apps
                .iter()
                .any(|allowed| app.contains(allowed.as_str()) || allowed.contains(app.as_str()))
        {
            return true;
        }

        if let Some(host) = url.and_then(url_host) {
            if self.domains.iter().any(|d| host_matches(&host, d)) {
                return true;
            }
        }

        // Loose fallback for observations where URL extraction failed
        let title = window_title.to_lowercase();
        if self.domains.iter().any(|d| title.contains(d.as_str())) {
            return true;
        }

        debug!("Whitelist rejected app={} url={:?}", app_name, url);
        false
    }
}

/// Strip scheme and trailing slash, lowercase.
pub fn normalize_domain(raw: &str) -> String {
    let lower = raw.trim().to_lowercase();
    let without_scheme = match lower.find("://") {
        Some(idx) => &lower[idx + 3..],
        None => lower.as_str(),
    };
    without_scheme.trim_end_matches('/').to_string()
}

/// Exact match or subdomain of `domain`.
pub fn host_matches(host: &str, domain: &str) -> bool {
    let host = host.trim_end_matches('.');
    let domain = domain.trim_end_matches('.');
    host == domain || host.ends_with(&format!(".{}", domain))
}
