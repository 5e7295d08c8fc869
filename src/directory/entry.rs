//! Directory entries, search filters and modifications

use std::collections::BTreeMap;
use std::fmt;

use super::dn::Dn;

/// A directory entry. Attribute names are stored lowercased since
/// attribute type matching is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub dn: Dn,
    attrs: BTreeMap<String, Vec<String>>,
}

impl Entry {
    /// Create an empty entry
    pub fn new(dn: Dn) -> Self {
        Self {
            dn,
            attrs: BTreeMap::new(),
        }
    }

    /// Builder-style attribute setter
    pub fn with<I, S>(mut self, attr: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set(attr, values);
        self
    }

    /// Replace all values of an attribute
    pub fn set<I, S>(&mut self, attr: &str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            self.attrs.remove(&attr.to_lowercase());
        } else {
            self.attrs.insert(attr.to_lowercase(), values);
        }
    }

    /// Remove an attribute entirely
    pub fn remove(&mut self, attr: &str) {
        self.attrs.remove(&attr.to_lowercase());
    }

    /// All values of an attribute (empty slice when absent)
    pub fn values(&self, attr: &str) -> &[String] {
        self.attrs
            .get(&attr.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// First value of an attribute
    pub fn first(&self, attr: &str) -> Option<&str> {
        self.values(attr).first().map(String::as_str)
    }

    /// First value parsed as an integer, `None` when absent or malformed
    pub fn first_int<T: std::str::FromStr>(&self, attr: &str) -> Option<T> {
        self.first(attr).and_then(|v| v.trim().parse().ok())
    }

    pub fn has(&self, attr: &str) -> bool {
        self.attrs.contains_key(&attr.to_lowercase())
    }

    /// Case-insensitive objectclass membership test
    pub fn has_object_class(&self, class: &str) -> bool {
        self.values("objectclass")
            .iter()
            .any(|c| c.eq_ignore_ascii_case(class))
    }

    /// Iterate attributes as (lowercased name, values)
    pub fn attributes(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Apply a modification in place
    pub fn apply(&mut self, modification: &Modification) {
        match modification {
            Modification::Replace(attr, values) => self.set(attr, values.clone()),
            Modification::Add(attr, values) => {
                let key = attr.to_lowercase();
                let existing = self.attrs.entry(key).or_default();
                for value in values {
                    if !existing.iter().any(|v| v.eq_ignore_ascii_case(value)) {
                        existing.push(value.clone());
                    }
                }
            }
            Modification::Delete(attr, values) => {
                let key = attr.to_lowercase();
                if values.is_empty() {
                    self.attrs.remove(&key);
                } else if let Some(existing) = self.attrs.get_mut(&key) {
                    existing.retain(|v| !values.iter().any(|d| d.eq_ignore_ascii_case(v)));
                    if existing.is_empty() {
                        self.attrs.remove(&key);
                    }
                }
            }
        }
    }
}

/// Search scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Base,
    OneLevel,
    Subtree,
}

/// A single attribute modification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modification {
    /// Replace all values; an empty list removes the attribute
    Replace(String, Vec<String>),
    /// Add values
    Add(String, Vec<String>),
    /// Delete the listed values, or the whole attribute when empty
    Delete(String, Vec<String>),
}

impl Modification {
    pub fn replace(attr: &str, value: impl Into<String>) -> Self {
        Modification::Replace(attr.to_string(), vec![value.into()])
    }

    pub fn clear(attr: &str) -> Self {
        Modification::Delete(attr.to_string(), Vec::new())
    }

    pub fn add(attr: &str, value: impl Into<String>) -> Self {
        Modification::Add(attr.to_string(), vec![value.into()])
    }

    pub fn delete_value(attr: &str, value: impl Into<String>) -> Self {
        Modification::Delete(attr.to_string(), vec![value.into()])
    }
}

/// Search filter, a small typed subset of RFC 4515
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Equals(String, String),
    Present(String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(attr: &str, value: impl Into<String>) -> Self {
        Filter::Equals(attr.to_string(), value.into())
    }

    pub fn object_class(class: &str) -> Self {
        Filter::eq("objectclass", class)
    }

    pub fn present(attr: &str) -> Self {
        Filter::Present(attr.to_string())
    }

    /// Evaluate the filter against an entry (case-insensitive matching)
    pub fn matches(&self, entry: &Entry) -> bool {
        match self {
            Filter::Equals(attr, value) => entry
                .values(attr)
                .iter()
                .any(|v| v.eq_ignore_ascii_case(value)),
            Filter::Present(attr) => attr == "objectclass" || entry.has(attr),
            Filter::And(filters) => filters.iter().all(|f| f.matches(entry)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(entry)),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Equals(attr, value) => write!(f, "({}={})", attr, escape_filter_value(value)),
            Filter::Present(attr) => write!(f, "({}=*)", attr),
            Filter::And(filters) => {
                write!(f, "(&")?;
                for filter in filters {
                    write!(f, "{}", filter)?;
                }
                write!(f, ")")
            }
            Filter::Or(filters) => {
                write!(f, "(|")?;
                for filter in filters {
                    write!(f, "{}", filter)?;
                }
                write!(f, ")")
            }
        }
    }
}

fn escape_filter_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\\' => out.push_str("\\5c"),
            '\0' => out.push_str("\\00"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_rendering() {
        let filter = Filter::And(vec![
            Filter::eq("nsuniqueid", "ffffffff-ffffffff-ffffffff-ffffffff"),
            Filter::object_class("nstombstone"),
        ]);
        assert_eq!(
            filter.to_string(),
            "(&(nsuniqueid=ffffffff-ffffffff-ffffffff-ffffffff)(objectclass=nstombstone))"
        );
        assert_eq!(Filter::eq("cn", "a*(b)").to_string(), "(cn=a\\2a\\28b\\29)");
    }

    #[test]
    fn test_filter_matching_is_case_insensitive() {
        let entry = Entry::new(Dn::new("cn=meToB,cn=replica"))
            .with("objectClass", ["top", "nsds5ReplicationAgreement"])
            .with("nsDS5ReplicaHost", ["B.example.com"]);
        let filter = Filter::And(vec![
            Filter::Or(vec![
                Filter::object_class("nsds5replicationagreement"),
                Filter::object_class("nsDSWindowsReplicationAgreement"),
            ]),
            Filter::eq("nsds5replicahost", "b.example.com"),
        ]);
        assert!(filter.matches(&entry));
        assert!(!Filter::present("nsds7WindowsReplicaSubtree").matches(&entry));
    }

    #[test]
    fn test_apply_modifications() {
        let mut entry = Entry::new(Dn::new("cn=replica")).with("nsDS5ReplicaReferral", ["ldap://a:389/x"]);
        entry.apply(&Modification::add("nsds5replicareferral", "ldap://b:389/x"));
        assert_eq!(entry.values("nsDS5ReplicaReferral").len(), 2);
        entry.apply(&Modification::delete_value("nsDS5ReplicaReferral", "LDAP://A:389/x"));
        assert_eq!(entry.values("nsds5replicareferral"), ["ldap://b:389/x".to_string()]);
        entry.apply(&Modification::clear("nsds5replicareferral"));
        assert!(!entry.has("nsds5replicareferral"));
    }
}
