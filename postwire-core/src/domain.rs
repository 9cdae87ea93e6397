//! Domain patterns: which origins a listener or pending request accepts.

use std::fmt;

use regex::Regex;

/// Origin pattern. `*` matches every origin.
#[derive(Debug, Clone, Default)]
pub enum DomainPattern {
    #[default]
    Any,
    Exact(String),
    OneOf(Vec<String>),
    Regex(Regex),
}

impl DomainPattern {
    /// True if `origin` is accepted by this pattern.
    pub fn matches(&self, origin: &str) -> bool {
        match self {
            DomainPattern::Any => true,
            DomainPattern::Exact(domain) => domain == origin,
            DomainPattern::OneOf(domains) => domains.iter().any(|d| d == "*" || d == origin),
            DomainPattern::Regex(re) => re.is_match(origin),
        }
    }

    /// Origin to address an outbound message to: the exact origin, or `*`.
    pub fn target_origin(&self) -> &str {
        match self {
            DomainPattern::Exact(domain) => domain,
            _ => "*",
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, DomainPattern::Any)
    }
}

impl PartialEq for DomainPattern {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DomainPattern::Any, DomainPattern::Any) => true,
            (DomainPattern::Exact(a), DomainPattern::Exact(b)) => a == b,
            (DomainPattern::OneOf(a), DomainPattern::OneOf(b)) => a == b,
            (DomainPattern::Regex(a), DomainPattern::Regex(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

impl Eq for DomainPattern {}

impl From<&str> for DomainPattern {
    fn from(s: &str) -> Self {
        if s == "*" {
            DomainPattern::Any
        } else {
            DomainPattern::Exact(s.to_string())
        }
    }
}

impl From<String> for DomainPattern {
    fn from(s: String) -> Self {
        if s == "*" {
            DomainPattern::Any
        } else {
            DomainPattern::Exact(s)
        }
    }
}

impl From<Vec<String>> for DomainPattern {
    fn from(domains: Vec<String>) -> Self {
        DomainPattern::OneOf(domains)
    }
}

impl From<Regex> for DomainPattern {
    fn from(re: Regex) -> Self {
        DomainPattern::Regex(re)
    }
}

/// Diagnostic form, used in error messages.
impl fmt::Display for DomainPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainPattern::Any => f.write_str("*"),
            DomainPattern::Exact(domain) => f.write_str(domain),
            DomainPattern::OneOf(domains) => write!(f, "[ {} ]", domains.join(" | ")),
            DomainPattern::Regex(re) => write!(f, "RegExp(/{}/)", re.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(DomainPattern::Any, "https://a.example", true)]
    #[case(DomainPattern::from("https://a.example"), "https://a.example", true)]
    #[case(DomainPattern::from("https://a.example"), "https://b.example", false)]
    #[case(
        DomainPattern::from(vec!["https://a.example".to_string(), "https://b.example".to_string()]),
        "https://b.example",
        true
    )]
    #[case(
        DomainPattern::from(vec!["https://a.example".to_string()]),
        "https://c.example",
        false
    )]
    #[case(
        DomainPattern::from(Regex::new(r"^https://[a-z]+\.example$").unwrap()),
        "https://zz.example",
        true
    )]
    #[case(
        DomainPattern::from(Regex::new(r"^https://[a-z]+\.example$").unwrap()),
        "http://zz.example",
        false
    )]
    fn matches_origin(
        #[case] pattern: DomainPattern,
        #[case] origin: &str,
        #[case] expected: bool,
    ) {
        assert_eq!(pattern.matches(origin), expected);
    }

    #[test]
    fn star_string_is_any() {
        assert!(DomainPattern::from("*").is_any());
        assert_eq!(DomainPattern::from("*").target_origin(), "*");
    }

    #[test]
    fn target_origin_only_for_exact() {
        assert_eq!(
            DomainPattern::from("https://a.example").target_origin(),
            "https://a.example"
        );
        let list = DomainPattern::from(vec!["https://a.example".to_string()]);
        assert_eq!(list.target_origin(), "*");
    }

    #[test]
    fn display_forms() {
        let list = DomainPattern::from(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(list.to_string(), "[ a | b ]");
        let re = DomainPattern::from(Regex::new("^a$").unwrap());
        assert_eq!(re.to_string(), "RegExp(/^a$/)");
        assert_eq!(DomainPattern::Any.to_string(), "*");
    }
}
