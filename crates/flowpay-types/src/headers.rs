//! Case-insensitive header storage and the FlowPay header vocabulary.
//!
//! Every HTTP library has its own header type. The negotiation code only ever
//! sees a [`HeaderTable`]: transports convert their native representation once,
//! at the boundary, and all lookups after that go through this one type.

use http::{HeaderMap, HeaderName, HeaderValue};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// An insertion-ordered header map with ASCII case-insensitive names.
///
/// Names are stored lowercased. Values are UTF-8 strings; headers that are not
/// valid UTF-8 are dropped when converting from an [`http::HeaderMap`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderTable {
    entries: Vec<(String, String)>,
}

#[derive(Debug, thiserror::Error)]
pub enum HeaderTableError {
    #[error("Invalid header name: {0}")]
    InvalidName(String),
    #[error("Invalid value for header {0}")]
    InvalidValue(String),
}

impl HeaderTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value stored under `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Sets `name` to a single value, keeping the position of the first existing entry.
    ///
    /// Returns the previous first value, if any.
    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) -> Option<String> {
        let name = name.as_ref().to_ascii_lowercase();
        let value = value.into();
        match self.entries.iter().position(|(key, _)| *key == name) {
            Some(index) => {
                let previous = std::mem::replace(&mut self.entries[index].1, value);
                let mut seen = 0usize;
                self.entries.retain(|(key, _)| {
                    if *key != name {
                        return true;
                    }
                    seen += 1;
                    seen == 1
                });
                Some(previous)
            }
            None => {
                self.entries.push((name, value));
                None
            }
        }
    }

    /// Adds a value without touching existing entries of the same name.
    pub fn append(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.entries
            .push((name.as_ref().to_ascii_lowercase(), value.into()));
    }

    /// Removes every value of `name`, returning the first.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let mut removed = None;
        self.entries.retain(|(key, value)| {
            if !key.eq_ignore_ascii_case(name) {
                return true;
            }
            if removed.is_none() {
                removed = Some(value.clone());
            }
            false
        });
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Converts back into an [`http::HeaderMap`] for an outbound request.
    pub fn to_header_map(&self) -> Result<HeaderMap, HeaderTableError> {
        let mut map = HeaderMap::with_capacity(self.entries.len());
        for (name, value) in &self.entries {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| HeaderTableError::InvalidName(name.clone()))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|_| HeaderTableError::InvalidValue(name.clone()))?;
            map.append(header_name, header_value);
        }
        Ok(map)
    }
}

impl From<&HeaderMap> for HeaderTable {
    fn from(map: &HeaderMap) -> Self {
        let entries = map
            .iter()
            .filter_map(|(name, value)| {
                let value = value.to_str().ok()?;
                Some((name.as_str().to_string(), value.to_string()))
            })
            .collect();
        Self { entries }
    }
}

impl<K, V> FromIterator<(K, V)> for HeaderTable
where
    K: AsRef<str>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut table = HeaderTable::new();
        for (name, value) in iter {
            table.append(name, value);
        }
        table
    }
}

impl Serialize for HeaderTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Header names for one deployment namespace.
///
/// `x-payment-required` is shared; every other name is `x-{namespace}-{field}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderNames {
    pub payment_required: String,
    pub mode: String,
    pub rate: String,
    pub amount: String,
    pub recipient: String,
    pub contract: String,
    pub min_deposit: String,
    pub token: String,
    pub description: String,
    pub stream_id: String,
    pub tx_hash: String,
}

impl HeaderNames {
    pub const PAYMENT_REQUIRED: &'static str = "x-payment-required";
    pub const DEFAULT_NAMESPACE: &'static str = "flowpay";

    pub fn for_namespace(namespace: &str) -> Self {
        let ns = namespace.trim().to_ascii_lowercase();
        let field = |suffix: &str| format!("x-{ns}-{suffix}");
        Self {
            payment_required: Self::PAYMENT_REQUIRED.to_string(),
            mode: field("mode"),
            rate: field("rate"),
            amount: field("amount"),
            recipient: field("recipient"),
            contract: field("contract"),
            min_deposit: field("mindeposit"),
            token: field("token"),
            description: field("description"),
            stream_id: field("stream-id"),
            tx_hash: field("tx-hash"),
        }
    }
}

impl Default for HeaderNames {
    fn default() -> Self {
        Self::for_namespace(Self::DEFAULT_NAMESPACE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let table: HeaderTable = [("X-FlowPay-Mode", "streaming")].into_iter().collect();
        assert_eq!(table.get("x-flowpay-mode"), Some("streaming"));
        assert_eq!(table.get("X-FLOWPAY-MODE"), Some("streaming"));
        assert!(table.get("x-flowpay-rate").is_none());
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut table: HeaderTable = [("a", "1"), ("b", "2"), ("A", "3")].into_iter().collect();
        let previous = table.insert("a", "9");
        assert_eq!(previous.as_deref(), Some("1"));
        let names: Vec<_> = table.iter().collect();
        assert_eq!(names, vec![("a", "9"), ("b", "2")]);
    }

    #[test]
    fn test_remove_drops_every_value() {
        let mut table: HeaderTable = [("set-cookie", "a"), ("Set-Cookie", "b")].into_iter().collect();
        assert_eq!(table.remove("SET-COOKIE").as_deref(), Some("a"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_from_http_header_map() {
        let mut map = HeaderMap::new();
        map.insert("x-payment-required", HeaderValue::from_static("true"));
        map.insert(
            "x-binary",
            HeaderValue::from_bytes(&[0xff, 0xfe]).unwrap(),
        );
        let table = HeaderTable::from(&map);
        assert_eq!(table.get("X-Payment-Required"), Some("true"));
        assert!(!table.contains("x-binary"));

        let round = table.to_header_map().unwrap();
        assert_eq!(round.get("x-payment-required").unwrap(), "true");
    }

    #[test]
    fn test_namespace_names() {
        let names = HeaderNames::for_namespace("Acme");
        assert_eq!(names.mode, "x-acme-mode");
        assert_eq!(names.min_deposit, "x-acme-mindeposit");
        assert_eq!(names.payment_required, "x-payment-required");
        assert_eq!(HeaderNames::default().stream_id, "x-flowpay-stream-id");
    }
}
