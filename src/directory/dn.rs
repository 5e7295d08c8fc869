//! Distinguished Names
//!
//! DNs compare case-insensitively and ignore insignificant spaces
//! around separators. Values are escaped per RFC 4514 when built from parts.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A distinguished name
#[derive(Debug, Clone)]
pub struct Dn {
    raw: String,
    key: String,
}

impl Dn {
    /// Wrap a DN string as-is
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let key = normalize(&raw);
        Self { raw, key }
    }

    /// Build `attr=value,<self>`, escaping the value
    pub fn child(&self, attr: &str, value: &str) -> Dn {
        let rdn = format!("{}={}", attr, escape_value(value));
        if self.raw.is_empty() {
            Dn::new(rdn)
        } else {
            Dn::new(format!("{},{}", rdn, self.raw))
        }
    }

    /// The individual RDN strings, still escaped
    pub fn rdns(&self) -> Vec<&str> {
        split_unescaped(&self.raw, ',')
            .into_iter()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .collect()
    }

    /// Unescaped value of the leftmost RDN
    pub fn rdn_value(&self) -> Option<String> {
        let first = *self.rdns().first()?;
        let parts = split_unescaped(first, '=');
        if parts.len() < 2 {
            return None;
        }
        let value_start = parts[0].len() + 1;
        Some(unescape_value(first[value_start..].trim()))
    }

    /// Attribute name of the leftmost RDN, lowercased
    pub fn rdn_attr(&self) -> Option<String> {
        let first = *self.rdns().first()?;
        let parts = split_unescaped(first, '=');
        Some(parts.first()?.trim().to_lowercase())
    }

    /// Parent DN, `None` for a single-RDN DN
    pub fn parent(&self) -> Option<Dn> {
        let rdns = self.rdns();
        if rdns.len() <= 1 {
            return None;
        }
        Some(Dn::new(rdns[1..].join(",")))
    }

    /// Number of RDNs
    pub fn depth(&self) -> usize {
        self.rdns().len()
    }

    /// True when `self` equals `base` or sits anywhere below it
    pub fn is_within(&self, base: &Dn) -> bool {
        if base.key.is_empty() {
            return true;
        }
        self.key == base.key || self.key.ends_with(&format!(",{}", base.key))
    }

    /// True when `self` is an immediate child of `base`
    pub fn is_child_of(&self, base: &Dn) -> bool {
        self.parent().map(|p| p == *base).unwrap_or(false)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Dn {}

impl Hash for Dn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl PartialOrd for Dn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Dn {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl From<&str> for Dn {
    fn from(value: &str) -> Self {
        Dn::new(value)
    }
}

/// Escape an attribute value for use inside an RDN
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let last = value.chars().count().saturating_sub(1);
    for (i, c) in value.chars().enumerate() {
        let needs_escape = matches!(c, ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=')
            || (i == 0 && (c == '#' || c == ' '))
            || (i == last && c == ' ');
        if needs_escape {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn unescape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Split on a separator that is not preceded by a backslash escape
fn split_unescaped(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        if c == '\\' {
            escaped = true;
        } else if c == sep {
            parts.push(&s[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&s[start..]);
    parts
}

fn normalize(raw: &str) -> String {
    split_unescaped(raw, ',')
        .into_iter()
        .map(|rdn| {
            let parts = split_unescaped(rdn, '=');
            if parts.len() < 2 {
                return rdn.trim().to_lowercase();
            }
            let attr = parts[0].trim().to_lowercase();
            let value = rdn[parts[0].len() + 1..].trim().to_lowercase();
            format!("{}={}", attr, value)
        })
        .filter(|r| !r.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_and_space_insensitive() {
        assert_eq!(
            Dn::new("cn=Masters, cn=IPA,cn=etc,dc=example,dc=com"),
            Dn::new("cn=masters,cn=ipa,cn=etc,dc=example,dc=com")
        );
    }

    #[test]
    fn test_child_escapes_value() {
        let tree = Dn::new("cn=mapping tree,cn=config");
        let suffix = tree.child("cn", "o=ipaca");
        assert_eq!(suffix.as_str(), "cn=o\\=ipaca,cn=mapping tree,cn=config");
        assert_eq!(suffix.rdn_value().as_deref(), Some("o=ipaca"));
        assert_eq!(suffix.parent(), Some(tree));
    }

    #[test]
    fn test_escaped_comma_is_one_rdn() {
        let dn = Dn::new("cn=dc\\=example\\,dc\\=com,cn=mapping tree,cn=config");
        assert_eq!(dn.depth(), 3);
        assert_eq!(dn.rdn_value().as_deref(), Some("dc=example,dc=com"));
    }

    #[test]
    fn test_within_and_child() {
        let base = Dn::new("cn=masters,cn=ipa,cn=etc,dc=example,dc=com");
        let host = base.child("cn", "ipa1.example.com");
        let service = host.child("cn", "CA");
        assert!(service.is_within(&base));
        assert!(host.is_child_of(&base));
        assert!(!service.is_child_of(&base));
        assert!(!base.is_within(&host));
        assert_eq!(service.rdn_attr().as_deref(), Some("cn"));
    }
}
