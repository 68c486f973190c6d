//! Configuration values that may be given literally or through the environment.
//!
//! ```json
//! {
//!   "agent_id": "weather-bot",
//!   "api_key": "$FLOWPAY_API_KEY",
//!   "oracle": { "api_key": "${GEMINI_API_KEY}" }
//! }
//! ```
//!
//! Secrets stay out of the JSON file and are resolved once, at load time.

use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::str::FromStr;

/// A value resolved during deserialization from a literal, `$VAR` or `${VAR}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralOrEnv<T>(T);

impl<T> LiteralOrEnv<T> {
    pub fn from_literal(value: T) -> Self {
        Self(value)
    }

    pub fn inner(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }

    /// Variable name referenced by `$VAR` or `${VAR}`, if `s` is such a reference.
    fn env_reference(s: &str) -> Option<&str> {
        if let Some(braced) = s.strip_prefix("${").and_then(|r| r.strip_suffix('}')) {
            return Some(braced);
        }
        let bare = s.strip_prefix('$')?;
        let is_name = !bare.is_empty() && bare.chars().all(|c| c.is_alphanumeric() || c == '_');
        is_name.then_some(bare)
    }
}

impl<T> Deref for LiteralOrEnv<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de, T> Deserialize<'de> for LiteralOrEnv<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        let value = match Self::env_reference(&raw) {
            Some(var_name) => std::env::var(var_name).map_err(|_| {
                serde::de::Error::custom(format!(
                    "Environment variable '{var_name}' not found (referenced as '{raw}')"
                ))
            })?,
            None => raw,
        };
        value
            .parse::<T>()
            .map(LiteralOrEnv)
            .map_err(|e| serde::de::Error::custom(format!("Failed to parse value: {e}")))
    }
}

impl<T: Serialize> Serialize for LiteralOrEnv<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_value() {
        let v: LiteralOrEnv<u32> = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(*v, 42);
    }

    #[test]
    fn test_env_reference_syntax() {
        assert_eq!(LiteralOrEnv::<String>::env_reference("$API_KEY"), Some("API_KEY"));
        assert_eq!(LiteralOrEnv::<String>::env_reference("${API_KEY}"), Some("API_KEY"));
        assert_eq!(LiteralOrEnv::<String>::env_reference("$"), None);
        assert_eq!(LiteralOrEnv::<String>::env_reference("$not-a-name"), None);
        assert_eq!(LiteralOrEnv::<String>::env_reference("plain"), None);
    }

    #[test]
    fn test_missing_env_var_is_an_error() {
        let result: Result<LiteralOrEnv<String>, _> =
            serde_json::from_str("\"$FLOWPAY_TYPES_SURELY_UNSET_VARIABLE\"");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("FLOWPAY_TYPES_SURELY_UNSET_VARIABLE"));
    }

    #[test]
    fn test_env_value_is_resolved() {
        // PATH is set in every test environment
        let v: LiteralOrEnv<String> = serde_json::from_str("\"${PATH}\"").unwrap();
        assert!(!v.is_empty());
    }
}
