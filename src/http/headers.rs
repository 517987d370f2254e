//! Ordered header fields for requests and responses.

use std::fmt;

/// Header fields in arrival (or insertion) order, one value per name.
///
/// Lookups ignore ASCII case. Setting a name that is already present
/// overwrites its value in place, so the field keeps its original slot when
/// the map is serialized.
///
/// ```
/// use slib_http::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Content-Type", "text/plain");
/// headers.insert("content-type", "text/html");
///
/// assert_eq!(headers.get("CONTENT-TYPE"), Some("text/html"));
/// assert_eq!(headers.len(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.fields
            .iter()
            .position(|(field, _)| field.eq_ignore_ascii_case(name))
    }

    /// Sets `name`, overwriting an existing value in place.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(index) => self.fields[index].1 = value,
            None => self.fields.push((name, value)),
        }
    }

    /// Value of `name`, ignoring case.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name).map(|index| self.fields[index].1.as_str())
    }

    /// `true` if `name` is present, ignoring case.
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Removes `name`, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.position(name).map(|index| self.fields.remove(index).1)
    }

    /// Number of distinct names.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

impl<N, V> Extend<(N, V)> for Headers
where
    N: Into<String>,
    V: Into<String>,
{
    fn extend<I: IntoIterator<Item = (N, V)>>(&mut self, iter: I) {
        for (name, value) in iter {
            self.insert(name, value);
        }
    }
}

impl<N, V> FromIterator<(N, V)> for Headers
where
    N: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        headers.extend(iter);
        headers
    }
}

/// Serializes as `Name: value\r\n` lines, without the blank terminator line.
impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.iter()
            .try_for_each(|(name, value)| write!(f, "{name}: {value}\r\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrite_keeps_first_slot() {
        let mut headers: Headers = [("X-Token", "a"), ("Host", "h")].into_iter().collect();
        headers.insert("x-token", "b");

        assert_eq!(headers.get("X-TOKEN"), Some("b"));
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            vec![("X-Token", "b"), ("Host", "h")]
        );
    }

    #[test]
    fn remove_returns_the_value() {
        let mut headers = Headers::new();
        headers.insert("X-Foo", "bar");
        assert_eq!(headers.remove("x-foo").as_deref(), Some("bar"));
        assert!(headers.is_empty());
        assert_eq!(headers.remove("x-foo"), None);
        assert!(!headers.contains("x-foo"));
    }

    #[test]
    fn serializes_header_lines() {
        let mut headers = Headers::new();
        assert_eq!(headers.to_string(), "");
        headers.insert("Content-Type", "text/html");
        headers.insert("Content-Length", "0");
        assert_eq!(
            headers.to_string(),
            "Content-Type: text/html\r\nContent-Length: 0\r\n"
        );
    }
}
