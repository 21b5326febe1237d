//! URL-safe names for jobs and streams.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::CoreError;

/// Maximum length of a [`Slug`].
pub const MAX_SLUG_LEN: usize = 64;

/// A lowercase, URL-safe identifier (`[a-z0-9][a-z0-9_-]*`).
///
/// Job and stream names appear as path segments in the HTTP surface, so they
/// are validated once at construction and can be embedded in routes and log
/// fields without escaping.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Slug(String);

impl Slug {
    pub fn new(value: impl Into<String>) -> Result<Self, CoreError> {
        let value = value.into();
        validate(&value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate(value: &str) -> Result<(), CoreError> {
    let mut chars = value.chars();
    let first = chars
        .next()
        .ok_or_else(|| CoreError::invalid_name(value, "must not be empty"))?;

    if value.len() > MAX_SLUG_LEN {
        return Err(CoreError::invalid_name(value, "longer than 64 characters"));
    }
    if !(first.is_ascii_lowercase() || first.is_ascii_digit()) {
        return Err(CoreError::invalid_name(
            value,
            "must start with a lowercase letter or digit",
        ));
    }
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-') {
        return Err(CoreError::invalid_name(
            value,
            "only lowercase letters, digits, '_' and '-' are allowed",
        ));
    }
    Ok(())
}

impl fmt::Display for Slug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Slug {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for Slug {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl core::borrow::Borrow<str> for Slug {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Slug {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Slug::new(raw).map_err(serde::de::Error::custom)
    }
}
