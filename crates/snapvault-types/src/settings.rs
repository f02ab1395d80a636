//! Key/value settings attached to a repository registration.
//!
//! Settings are flat string maps with typed accessors. Unknown keys are kept
//! so that repository types can define their own knobs.

use std::{collections::BTreeMap, fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

/// Errors reading a typed setting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("setting [{key}] has invalid value [{value}]: expected {expected}")]
    InvalidValue {
        key: String,
        value: String,
        expected: &'static str,
    },

    #[error("missing required setting [{0}]")]
    Missing(String),
}

/// Immutable key/value settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings {
    values: BTreeMap<String, String>,
}

impl Settings {
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::default()
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_required(&self, key: &str) -> Result<&str, SettingsError> {
        self.get(key)
            .ok_or_else(|| SettingsError::Missing(key.to_string()))
    }

    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool, SettingsError> {
        match self.get(key) {
            None => Ok(default),
            Some("true") => Ok(true),
            Some("false") => Ok(false),
            Some(other) => Err(invalid(key, other, "true or false")),
        }
    }

    pub fn get_u64(&self, key: &str, default: u64) -> Result<u64, SettingsError> {
        self.get_parsed(key, default, "an unsigned integer")
    }

    pub fn get_f64(&self, key: &str, default: f64) -> Result<f64, SettingsError> {
        self.get_parsed(key, default, "a number")
    }

    /// Reads a byte size such as `512`, `64kb`, or `1mb`.
    pub fn get_bytes(&self, key: &str, default: Option<u64>) -> Result<Option<u64>, SettingsError> {
        let Some(raw) = self.get(key) else {
            return Ok(default);
        };
        let lower = raw.to_ascii_lowercase();
        let (digits, multiplier) = if let Some(n) = lower.strip_suffix("kb") {
            (n, 1024)
        } else if let Some(n) = lower.strip_suffix("mb") {
            (n, 1024 * 1024)
        } else if let Some(n) = lower.strip_suffix('b') {
            (n, 1)
        } else {
            (lower.as_str(), 1)
        };
        digits
            .trim()
            .parse::<u64>()
            .map(|n| Some(n * multiplier))
            .map_err(|_| invalid(key, raw, "a byte size"))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns a builder seeded with these settings.
    pub fn to_builder(&self) -> SettingsBuilder {
        SettingsBuilder {
            values: self.values.clone(),
        }
    }

    fn get_parsed<T: FromStr>(
        &self,
        key: &str,
        default: T,
        expected: &'static str,
    ) -> Result<T, SettingsError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| invalid(key, raw, expected)),
        }
    }
}

fn invalid(key: &str, value: &str, expected: &'static str) -> SettingsError {
    SettingsError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        expected,
    }
}

/// Builder for [`Settings`].
#[derive(Debug, Clone, Default)]
pub struct SettingsBuilder {
    values: BTreeMap<String, String>,
}

impl SettingsBuilder {
    pub fn put(mut self, key: impl Into<String>, value: impl Display) -> Self {
        self.values.insert(key.into(), value.to_string());
        self
    }

    pub fn remove(mut self, key: &str) -> Self {
        self.values.remove(key);
        self
    }

    pub fn build(self) -> Settings {
        Settings {
            values: self.values,
        }
    }
}
