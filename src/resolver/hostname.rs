//! Host header parsing: normalisation, subdomain candidate extraction, preview-environment detection.

use regex::Regex;
use serde::Serialize;
use std::net::IpAddr;

/// A first-label pattern identifying ephemeral preview deployments.
#[derive(Clone, Debug)]
pub enum PreviewPattern {
    /// A hyphen-separated label whose inner segment is a 9-char generated hash
    /// mixing letters and digits (e.g. `shop-k2j3h4g5f-team`).
    DeploymentHash,
    Regex(Regex),
}

impl PreviewPattern {
    pub fn matches(&self, label: &str) -> bool {
        match self {
            PreviewPattern::DeploymentHash => is_deployment_hash_label(label),
            PreviewPattern::Regex(re) => re.is_match(label),
        }
    }
}

fn is_deployment_hash_label(label: &str) -> bool {
    let segments: Vec<&str> = label.split('-').collect();
    if segments.len() < 3 {
        return false;
    }
    segments[1..segments.len() - 1].iter().any(|seg| {
        seg.len() == 9
            && seg.chars().all(|c| c.is_ascii_alphanumeric())
            && seg.chars().any(|c| c.is_ascii_digit())
            && seg.chars().any(|c| c.is_ascii_alphabetic())
    })
}

#[derive(Clone, Debug)]
pub struct HostRules {
    /// Hosts that never carry a store subdomain (compared after normalisation).
    pub loopback_hosts: Vec<String>,
    pub preview_patterns: Vec<PreviewPattern>,
}

impl Default for HostRules {
    fn default() -> Self {
        HostRules {
            loopback_hosts: vec!["localhost".into()],
            preview_patterns: vec![PreviewPattern::DeploymentHash],
        }
    }
}

/// Why a host yielded no subdomain candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoCandidate {
    EmptyHost,
    Loopback,
    IpLiteral,
    TooFewLabels,
    PreviewEnvironment,
}

/// Lowercases, strips the port and a trailing dot. `Shop.Example.com:8080.` -> `shop.example.com`.
pub fn normalize_host(raw: &str) -> String {
    let host = raw.trim();
    let host = if host.starts_with('[') {
        // [v6]:port
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else if host.matches(':').count() == 1 {
        host.split(':').next().unwrap_or(host)
    } else {
        host
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_ip_literal(host: &str) -> bool {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok()
}

/// First label of a normalised host when it can name a store.
pub fn subdomain_candidate(host: &str, rules: &HostRules) -> Result<String, NoCandidate> {
    if host.is_empty() {
        return Err(NoCandidate::EmptyHost);
    }
    if rules.loopback_hosts.iter().any(|h| h.eq_ignore_ascii_case(host)) {
        return Err(NoCandidate::Loopback);
    }
    if is_ip_literal(host) {
        return Err(NoCandidate::IpLiteral);
    }
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 3 || labels[0].is_empty() {
        return Err(NoCandidate::TooFewLabels);
    }
    let first = labels[0];
    if rules.preview_patterns.iter().any(|p| p.matches(first)) {
        return Err(NoCandidate::PreviewEnvironment);
    }
    Ok(first.to_string())
}

/// Lowercase with hyphens and underscores removed. `Aurelio-Living` -> `aurelioliving`.
pub fn normalize_label(s: &str) -> String {
    s.chars()
        .filter(|c| *c != '-' && *c != '_')
        .flat_map(|c| c.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> HostRules {
        HostRules {
            loopback_hosts: vec!["localhost".into()],
            preview_patterns: vec![
                PreviewPattern::DeploymentHash,
                PreviewPattern::Regex(Regex::new("^[a-z0-9-]+-git-[a-z0-9-]+$").unwrap()),
            ],
        }
    }

    #[test]
    fn normalize_host_strips_port_case_and_dot() {
        assert_eq!(normalize_host("Shop.Example.COM:8080"), "shop.example.com");
        assert_eq!(normalize_host("shop.example.com."), "shop.example.com");
        assert_eq!(normalize_host("[::1]:3000"), "[::1]");
        assert_eq!(normalize_host("  localhost:3000 "), "localhost");
    }

    #[test]
    fn three_labels_yield_first_label() {
        assert_eq!(
            subdomain_candidate("aurelioliving.myaurelio.com", &rules()).unwrap(),
            "aurelioliving"
        );
        assert_eq!(subdomain_candidate("a.b.c.d", &rules()).unwrap(), "a");
    }

    #[test]
    fn short_loopback_and_ip_hosts_have_no_candidate() {
        assert_eq!(subdomain_candidate("myaurelio.com", &rules()), Err(NoCandidate::TooFewLabels));
        assert_eq!(subdomain_candidate("localhost", &rules()), Err(NoCandidate::Loopback));
        assert_eq!(subdomain_candidate("127.0.0.1", &rules()), Err(NoCandidate::IpLiteral));
        assert_eq!(subdomain_candidate("[::1]", &rules()), Err(NoCandidate::IpLiteral));
        assert_eq!(subdomain_candidate("", &rules()), Err(NoCandidate::EmptyHost));
    }

    #[test]
    fn preview_labels_are_ignored() {
        assert_eq!(
            subdomain_candidate("storefront-k2j3h4g5f-aurelio.vercel.app", &rules()),
            Err(NoCandidate::PreviewEnvironment)
        );
        assert_eq!(
            subdomain_candidate("storefront-git-main-aurelio.vercel.app", &rules()),
            Err(NoCandidate::PreviewEnvironment)
        );
    }

    #[test]
    fn ordinary_hyphenated_labels_are_not_previews() {
        assert!(!is_deployment_hash_label("best-furniture-shop"));
        assert!(!is_deployment_hash_label("aurelio-living"));
        assert!(!is_deployment_hash_label("123456789-abc"));
        assert!(is_deployment_hash_label("shop-a1b2c3d4e-team"));
    }

    #[test]
    fn normalize_label_strips_separators() {
        assert_eq!(normalize_label("Aurelio-Living"), "aurelioliving");
        assert_eq!(normalize_label("aurelio_living"), "aurelioliving");
    }
}
