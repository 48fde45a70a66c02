// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Egress policy evaluation.
//!
//! A policy is compiled once from the manifest's `egress.allow` / `egress.deny`
//! pattern lists and then answers `resolve(host, port)` as a pure function.
//! Deny rules always win over allow rules, and within each set exact matches
//! are consulted before CIDR ranges, which are consulted before wildcard
//! domain patterns. Anything matched by neither set is denied.
//!
//! Supported pattern forms, each with an optional `:port` suffix:
//!
//! * exact DNS names (`api.example.com`), matched case-insensitively
//! * IP literals (`10.1.2.3`, `[2001:db8::1]`)
//! * CIDR ranges (`10.0.0.0/8`)
//! * `*` single-label and `**` any-suffix wildcards (`*.example.com`,
//!   `**.amazonaws.com`)
//! * the literal `host`, naming the parent instance's loopback

use std::net::IpAddr;

use ipnetwork::IpNetwork;

use crate::error::Error;
use crate::manifest::EgressRules;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
}

/// Compiled, immutable policy evaluator.
pub struct EgressPolicy {
    allow: RuleSet,
    deny: RuleSet,
}

impl EgressPolicy {
    pub fn compile(rules: &EgressRules) -> Result<Self, Error> {
        Ok(Self {
            allow: RuleSet::compile(&rules.allow)?,
            deny: RuleSet::compile(&rules.deny)?,
        })
    }

    /// Permits everything. Useful for tests and for proxies carrying traffic
    /// that was already vetted elsewhere.
    pub fn allow_all() -> Self {
        Self {
            allow: RuleSet {
                exact: Vec::new(),
                cidr: vec![
                    CidrRule {
                        net: "0.0.0.0/0".parse().unwrap(),
                        port: None,
                    },
                    CidrRule {
                        net: "::/0".parse().unwrap(),
                        port: None,
                    },
                ],
                wildcard: vec![WildcardRule {
                    pattern: DomainPattern::parse("**").unwrap(),
                    port: None,
                }],
            },
            deny: RuleSet::default(),
        }
    }

    /// Decides whether egress to `host:port` is permitted.
    pub fn resolve(&self, host: &str, port: u16) -> Verdict {
        let query = match Query::parse(host) {
            Some(query) => query,
            // Neither a valid IP nor a DNS-1123 subdomain.
            None => return Verdict::Deny,
        };

        if self.deny.matches(&query, port) {
            return Verdict::Deny;
        }
        if self.allow.matches(&query, port) {
            return Verdict::Allow;
        }
        Verdict::Deny
    }
}

enum Query {
    Ip(IpAddr),
    Name(String),
}

impl Query {
    fn parse(host: &str) -> Option<Self> {
        // IPv6 literals arrive bracketed from URI authorities.
        let bare = host
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(host);

        if let Ok(addr) = bare.parse::<IpAddr>() {
            return Some(Query::Ip(addr));
        }

        let lowered = bare.to_ascii_lowercase();
        is_dns1123_subdomain(&lowered).then_some(Query::Name(lowered))
    }
}

#[derive(Default)]
struct RuleSet {
    exact: Vec<ExactRule>,
    cidr: Vec<CidrRule>,
    wildcard: Vec<WildcardRule>,
}

impl RuleSet {
    fn compile(patterns: &[String]) -> Result<Self, Error> {
        let mut set = RuleSet::default();

        for pattern in patterns {
            let (host_part, port) = split_port(pattern)?;

            if let Ok(net) = host_part.parse::<IpNetwork>() {
                if host_part.contains('/') {
                    set.cidr.push(CidrRule { net, port });
                } else {
                    // A bare IP literal is an exact rule.
                    set.exact.push(ExactRule {
                        host: ExactHost::Ip(net.ip()),
                        port,
                    });
                }
                continue;
            }

            let lowered = host_part.to_ascii_lowercase();

            if lowered.contains('*') {
                set.wildcard.push(WildcardRule {
                    pattern: DomainPattern::parse(&lowered).ok_or_else(|| {
                        Error::ConfigInvalid(format!("invalid egress pattern: {pattern}"))
                    })?,
                    port,
                });
                continue;
            }

            if !is_dns1123_subdomain(&lowered) {
                return Err(Error::ConfigInvalid(format!(
                    "egress host is neither an IP, a CIDR, nor a DNS name: {pattern}"
                )));
            }

            set.exact.push(ExactRule {
                host: ExactHost::Name(lowered),
                port,
            });
        }

        Ok(set)
    }

    fn matches(&self, query: &Query, port: u16) -> bool {
        if self
            .exact
            .iter()
            .any(|rule| rule.matches(query) && port_matches(rule.port, port))
        {
            return true;
        }

        if let Query::Ip(addr) = query {
            if self
                .cidr
                .iter()
                .any(|rule| rule.net.contains(*addr) && port_matches(rule.port, port))
            {
                return true;
            }
        }

        if let Query::Name(name) = query {
            if self
                .wildcard
                .iter()
                .any(|rule| rule.pattern.matches(name) && port_matches(rule.port, port))
            {
                return true;
            }
        }

        false
    }
}

fn port_matches(rule_port: Option<u16>, port: u16) -> bool {
    match rule_port {
        Some(p) => p == port,
        None => true,
    }
}

struct ExactRule {
    host: ExactHost,
    port: Option<u16>,
}

enum ExactHost {
    Ip(IpAddr),
    Name(String),
}

impl ExactRule {
    fn matches(&self, query: &Query) -> bool {
        match (&self.host, query) {
            (ExactHost::Ip(rule), Query::Ip(addr)) => rule == addr,
            (ExactHost::Name(rule), Query::Name(name)) => rule == name,
            _ => false,
        }
    }
}

struct CidrRule {
    net: IpNetwork,
    port: Option<u16>,
}

struct WildcardRule {
    pattern: DomainPattern,
    port: Option<u16>,
}

/// Splits a trailing `:port` off a pattern, leaving IPv6 literals and CIDR
/// ranges intact.
fn split_port(pattern: &str) -> Result<(&str, Option<u16>), Error> {
    let invalid = || Error::ConfigInvalid(format!("invalid egress pattern: {pattern}"));

    if pattern.is_empty() {
        return Err(invalid());
    }

    if let Some(rest) = pattern.strip_prefix('[') {
        // "[v6]" or "[v6]:port"
        let close = rest.find(']').ok_or_else(invalid)?;
        let host = &rest[..close];
        return match &rest[close + 1..] {
            "" => Ok((host, None)),
            tail => {
                let port = tail
                    .strip_prefix(':')
                    .and_then(|p| p.parse::<u16>().ok())
                    .filter(|p| *p != 0)
                    .ok_or_else(invalid)?;
                Ok((host, Some(port)))
            }
        };
    }

    match pattern.matches(':').count() {
        0 => Ok((pattern, None)),
        1 => {
            let (host, port) = pattern.split_once(':').unwrap();
            let port = port
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(invalid)?;
            if host.is_empty() {
                return Err(invalid());
            }
            Ok((host, Some(port)))
        }
        // Unbracketed IPv6 literal.
        _ => Ok((pattern, None)),
    }
}

enum PatternLabel {
    /// `*`, exactly one label.
    One,
    /// `**`, one or more labels.
    Rest,
    Literal(String),
}

/// Domain wildcard pattern, stored right-to-left so matching walks from the
/// TLD inward.
struct DomainPattern {
    labels: Vec<PatternLabel>,
}

impl DomainPattern {
    fn parse(pattern: &str) -> Option<Self> {
        let mut labels = Vec::new();
        for part in pattern.rsplit('.') {
            let label = match part {
                "*" => PatternLabel::One,
                "**" => PatternLabel::Rest,
                _ if is_dns1123_label(part) => PatternLabel::Literal(part.to_string()),
                _ => return None,
            };
            labels.push(label);
        }
        Some(Self { labels })
    }

    fn matches(&self, name: &str) -> bool {
        let mut name_labels = name.rsplit('.');

        for pattern in &self.labels {
            let candidate = match name_labels.next() {
                Some(candidate) => candidate,
                None => return false,
            };

            match pattern {
                PatternLabel::Rest => return true,
                PatternLabel::One => continue,
                PatternLabel::Literal(expected) => {
                    if expected != candidate {
                        return false;
                    }
                }
            }
        }

        name_labels.next().is_none()
    }
}

fn is_dns1123_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && label
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !label.starts_with('-')
        && !label.ends_with('-')
}

fn is_dns1123_subdomain(name: &str) -> bool {
    !name.is_empty() && name.len() <= 253 && name.split('.').all(is_dns1123_label)
}

#[cfg(test)]
mod tests {
    use super::{EgressPolicy, Verdict};
    use crate::manifest::EgressRules;

    fn policy(allow: &[&str], deny: &[&str]) -> EgressPolicy {
        let rules = EgressRules {
            allow: allow.iter().map(|s| s.to_string()).collect(),
            deny: deny.iter().map(|s| s.to_string()).collect(),
        };
        EgressPolicy::compile(&rules).unwrap()
    }

    #[test]
    fn default_is_deny() {
        let p = policy(&[], &[]);
        assert_eq!(p.resolve("example.com", 443), Verdict::Deny);
    }

    #[test]
    fn exact_names_match_case_insensitively() {
        let p = policy(&["example.com"], &[]);
        assert_eq!(p.resolve("example.com", 443), Verdict::Allow);
        assert_eq!(p.resolve("Example.COM", 80), Verdict::Allow);
        assert_eq!(p.resolve("other.example.com", 443), Verdict::Deny);
        assert_eq!(p.resolve("example.net", 443), Verdict::Deny);
    }

    #[test]
    fn deny_wins_over_allow() {
        let p = policy(&["**.example.com"], &["bad.example.com"]);
        assert_eq!(p.resolve("good.example.com", 443), Verdict::Allow);
        assert_eq!(p.resolve("bad.example.com", 443), Verdict::Deny);
    }

    #[test]
    fn ip_literals_and_cidrs() {
        let p = policy(&["10.0.0.0/8", "192.168.1.7"], &["10.9.9.9"]);
        assert_eq!(p.resolve("10.1.2.3", 443), Verdict::Allow);
        assert_eq!(p.resolve("10.9.9.9", 443), Verdict::Deny);
        assert_eq!(p.resolve("192.168.1.7", 22), Verdict::Allow);
        assert_eq!(p.resolve("192.168.1.8", 22), Verdict::Deny);
    }

    #[test]
    fn ipv6_literals_accept_brackets() {
        let p = policy(&["[2001:db8::1]"], &[]);
        assert_eq!(p.resolve("[2001:db8::1]", 443), Verdict::Allow);
        assert_eq!(p.resolve("2001:db8::1", 443), Verdict::Allow);
        assert_eq!(p.resolve("[2001:db8::2]", 443), Verdict::Deny);
    }

    #[test]
    fn single_label_wildcard_spans_one_label() {
        let p = policy(&["*.example.com"], &[]);
        assert_eq!(p.resolve("api.example.com", 443), Verdict::Allow);
        assert_eq!(p.resolve("a.b.example.com", 443), Verdict::Deny);
        assert_eq!(p.resolve("example.com", 443), Verdict::Deny);
    }

    #[test]
    fn any_suffix_wildcard_spans_many_labels() {
        let p = policy(&["**.amazonaws.com"], &[]);
        assert_eq!(p.resolve("kms.us-east-1.amazonaws.com", 443), Verdict::Allow);
        assert_eq!(p.resolve("s3.amazonaws.com", 443), Verdict::Allow);
        assert_eq!(p.resolve("amazonaws.com", 443), Verdict::Deny);
        assert_eq!(p.resolve("example.com", 443), Verdict::Deny);
    }

    #[test]
    fn port_suffix_restricts_the_entry() {
        let p = policy(&["example.com:443", "10.0.0.0/8:443"], &[]);
        assert_eq!(p.resolve("example.com", 443), Verdict::Allow);
        assert_eq!(p.resolve("example.com", 80), Verdict::Deny);
        assert_eq!(p.resolve("10.1.1.1", 443), Verdict::Allow);
        assert_eq!(p.resolve("10.1.1.1", 80), Verdict::Deny);
    }

    #[test]
    fn parent_host_literal_is_an_exact_name() {
        let p = policy(&["host"], &[]);
        assert_eq!(p.resolve("host", 8080), Verdict::Allow);
        assert_eq!(p.resolve("hostile.example.com", 8080), Verdict::Deny);
    }

    #[test]
    fn invalid_hosts_are_denied() {
        let p = EgressPolicy::allow_all();
        assert_eq!(p.resolve("not a host", 80), Verdict::Deny);
        assert_eq!(p.resolve("under_score.example.com", 80), Verdict::Deny);
        assert_eq!(p.resolve("", 80), Verdict::Deny);
        // But anything syntactically valid passes allow_all.
        assert_eq!(p.resolve("example.com", 80), Verdict::Allow);
        assert_eq!(p.resolve("192.0.2.1", 80), Verdict::Allow);
    }

    #[test]
    fn malformed_patterns_are_config_errors() {
        let rules = EgressRules {
            allow: vec!["bad_host".to_string()],
            deny: vec![],
        };
        assert!(EgressPolicy::compile(&rules).is_err());

        let rules = EgressRules {
            allow: vec!["example.com:0".to_string()],
            deny: vec![],
        };
        assert!(EgressPolicy::compile(&rules).is_err());
    }

    #[test]
    fn allow_set_minus_deny_set_behaves_like_sets() {
        let p = policy(
            &["a.example.com", "b.example.com", "192.0.2.0/24"],
            &["b.example.com", "192.0.2.66"],
        );

        // allow \ deny
        assert_eq!(p.resolve("a.example.com", 443), Verdict::Allow);
        assert_eq!(p.resolve("192.0.2.1", 443), Verdict::Allow);
        // deny
        assert_eq!(p.resolve("b.example.com", 443), Verdict::Deny);
        assert_eq!(p.resolve("192.0.2.66", 443), Verdict::Deny);
        // neither
        assert_eq!(p.resolve("c.example.com", 443), Verdict::Deny);
        assert_eq!(p.resolve("198.51.100.1", 443), Verdict::Deny);
    }
}
