//! An ordered, case-insensitive header multimap.
//!
//! [`Headers`] preserves the order in which fields were added (including the
//! relative order of repeated fields), compares names case-insensitively, and
//! allows multiple values per name. Names and values reuse the validated
//! [`http::HeaderName`] and [`http::HeaderValue`] types.

use std::fmt;

use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;

/// An ordered collection of header fields.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(HeaderName, HeaderValue)>,
}

impl Headers {
    /// Create an empty header collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty header collection with room for `capacity` fields.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    /// Number of fields, counting each value of a repeated name.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Are there no fields at all?
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Add a field after all existing fields, keeping any previous values for `name`.
    pub fn append(&mut self, name: HeaderName, value: HeaderValue) {
        self.fields.push((name, value));
    }

    /// Set `name` to a single value.
    ///
    /// The new value takes the position of the first existing value for `name`,
    /// all other values for `name` are removed. Returns `true` if a value was replaced.
    pub fn insert(&mut self, name: HeaderName, value: HeaderValue) -> bool {
        match self.fields.iter().position(|(n, _)| *n == name) {
            Some(index) => {
                self.fields[index].1 = value;
                let mut seen = 0usize;
                self.fields.retain(|(n, _)| {
                    if *n == name {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
                true
            }
            None => {
                self.fields.push((name, value));
                false
            }
        }
    }

    /// The first value for `name`, if any.
    pub fn get<K: AsRef<str>>(&self, name: K) -> Option<&HeaderValue> {
        let name = name.as_ref();
        self.fields
            .iter()
            .find(|(n, _)| n.as_str().eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// All values for `name`, in insertion order.
    pub fn get_all<'a, K: AsRef<str>>(
        &'a self,
        name: K,
    ) -> impl Iterator<Item = &'a HeaderValue> + 'a {
        let name: Box<str> = name.as_ref().into();
        self.fields
            .iter()
            .filter(move |(n, _)| n.as_str().eq_ignore_ascii_case(&name))
            .map(|(_, v)| v)
    }

    /// Is there at least one value for `name`?
    pub fn contains<K: AsRef<str>>(&self, name: K) -> bool {
        self.get(name).is_some()
    }

    /// Remove every value for `name`, returning how many were removed.
    pub fn remove<K: AsRef<str>>(&mut self, name: K) -> usize {
        let name = name.as_ref();
        let before = self.fields.len();
        self.fields
            .retain(|(n, _)| !n.as_str().eq_ignore_ascii_case(name));
        before - self.fields.len()
    }

    /// Iterate over all fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &HeaderValue)> {
        self.fields.iter().map(|(n, v)| (n, v))
    }

    /// Does any comma-separated token of `name` match `token` (case-insensitive)?
    pub fn has_token<K: AsRef<str>>(&self, name: K, token: &str) -> bool {
        self.get_all(name).any(|value| {
            value
                .to_str()
                .map(|value| {
                    value
                        .split(',')
                        .any(|t| t.trim().eq_ignore_ascii_case(token))
                })
                .unwrap_or(false)
        })
    }

    /// Add every field of `defaults` whose name is not already present.
    ///
    /// Values already set here take precedence over the defaults.
    pub fn merge_defaults(&mut self, defaults: &Headers) {
        let mut missing = Vec::new();
        for (name, value) in defaults.iter() {
            if !self.contains(name) {
                missing.push((name.clone(), value.clone()));
            }
        }
        self.fields.extend(missing);
    }

    /// Convert into an [`http::HeaderMap`], preserving the order of values per name.
    pub fn to_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.fields.len());
        for (name, value) in &self.fields {
            map.append(name.clone(), value.clone());
        }
        map
    }
}

impl From<&HeaderMap> for Headers {
    fn from(map: &HeaderMap) -> Self {
        map.iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

impl From<HeaderMap> for Headers {
    fn from(map: HeaderMap) -> Self {
        Self::from(&map)
    }
}

impl FromIterator<(HeaderName, HeaderValue)> for Headers {
    fn from_iter<T: IntoIterator<Item = (HeaderName, HeaderValue)>>(iter: T) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

impl Extend<(HeaderName, HeaderValue)> for Headers {
    fn extend<T: IntoIterator<Item = (HeaderName, HeaderValue)>>(&mut self, iter: T) {
        self.fields.extend(iter)
    }
}

impl IntoIterator for Headers {
    type Item = (HeaderName, HeaderValue);
    type IntoIter = std::vec::IntoIter<(HeaderName, HeaderValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl fmt::Debug for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
