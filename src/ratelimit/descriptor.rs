//! Bucket key derivation.
//!
//! A bucket key names one independent counter in the shared store. Keys must be
//! identical for identical logical input on every instance, so everything here is pure:
//! components are trimmed and lowercased, reserved characters are percent-encoded, and
//! absent optional dimensions become a sentinel that no encoded value can produce.

use std::collections::BTreeMap;
use std::fmt::Write;

use super::rules::RateLimitPolicy;
use crate::error::{LimiterError, Result};

/// Stands in for an absent optional dimension. Encoded values never contain `%-`
/// because every `%` they carry is followed by two hex digits.
pub const ABSENT_SENTINEL: &str = "%-";

/// A canonical bucket identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey(String);

impl BucketKey {
    /// Derive the key for `policy` from request dimensions.
    ///
    /// If the policy declares dimensions, exactly those are used, in declared order.
    /// Otherwise every supplied dimension is used, ordered by name.
    pub fn resolve<I, K, V>(policy: &RateLimitPolicy, dimensions: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut supplied = BTreeMap::new();
        for (name, value) in dimensions {
            let name = normalize_component(name.as_ref())
                .ok_or_else(|| LimiterError::InvalidKey("dimension name is empty".to_string()))?;
            let value = normalize_component(value.as_ref()).ok_or_else(|| {
                LimiterError::InvalidKey(format!("dimension '{}' has an empty value", name))
            })?;
            if supplied.insert(name.clone(), value).is_some() {
                return Err(LimiterError::InvalidKey(format!(
                    "dimension '{}' supplied more than once",
                    name
                )));
            }
        }

        let mut key = encode(policy.name());

        if policy.dimensions().is_empty() {
            for (name, value) in &supplied {
                push_pair(&mut key, name, &encode(value));
            }
        } else {
            for dimension in policy.dimensions() {
                let name = normalize_component(&dimension.name).ok_or_else(|| {
                    LimiterError::InvalidPolicy(format!("{}: dimension name is empty", policy.name()))
                })?;
                match supplied.get(&name) {
                    Some(value) => push_pair(&mut key, &name, &encode(value)),
                    None if dimension.optional => push_pair(&mut key, &name, ABSENT_SENTINEL),
                    None => {
                        return Err(LimiterError::InvalidKey(format!(
                            "required dimension '{}' missing for policy '{}'",
                            name,
                            policy.name()
                        )))
                    }
                }
            }
        }

        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for BucketKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Trim and case-fold a key component. `None` if nothing is left.
pub(crate) fn normalize_component(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

fn push_pair(key: &mut String, name: &str, encoded_value: &str) {
    key.push('|');
    key.push_str(&encode(name));
    key.push('=');
    key.push_str(encoded_value);
}

fn encode(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for c in component.chars() {
        match c {
            '%' | '|' | '=' | '{' | '}' => {
                let _ = write!(out, "%{:02X}", c as u32);
            }
            c if c.is_control() => {
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    let _ = write!(out, "%{:02X}", byte);
                }
            }
            c => out.push(c),
        }
    }
    out
}
