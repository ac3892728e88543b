// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Flat string-keyed record used to persist channel endpoints in an external store.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RecordError;

/// String-keyed field set. Values are stored string-encoded.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, String>,
}

impl Record {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw field value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Stores `value` string-encoded under `key`.
    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
        self.fields.insert(key.into(), value.to_string());
    }

    /// Parses `key`, falling back to `default` when the field is missing or malformed.
    ///
    /// A partial record is not an error.
    pub fn parse_or<T: FromStr>(&self, key: &str, default: T) -> T {
        self.get(key).and_then(|raw| raw.parse().ok()).unwrap_or(default)
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` if the record holds no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Encodes the record as a flat TOML table.
    pub fn to_toml_string(&self) -> Result<String, RecordError> {
        Ok(toml::to_string(self)?)
    }

    /// Decodes a record from a flat TOML table of strings.
    pub fn from_toml_str(raw: &str) -> Result<Self, RecordError> {
        Ok(toml::from_str(raw)?)
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = Self::new();
        for (key, value) in iter {
            record.set(key, value);
        }
        record
    }
}
