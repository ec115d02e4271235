//! Serialized file formats for parameters, configuration and image
//! metadata.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CalibError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    #[default]
    Json,
    Toml,
}

impl DataFormat {
    /// File extension without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            DataFormat::Json => "json",
            DataFormat::Toml => "toml",
        }
    }

    /// Format selected by the extension of `path`.
    pub fn from_path(path: &Path) -> Result<Self, CalibError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Ok(DataFormat::Json),
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Ok(DataFormat::Toml),
            _ => Err(CalibError::InvalidConfig(format!(
                "unsupported file extension of '{}', expected .json or .toml",
                path.display()
            ))),
        }
    }

    pub fn encode<T: Serialize>(self, value: &T) -> Result<String, CalibError> {
        match self {
            DataFormat::Json => serde_json::to_string_pretty(value)
                .map_err(|e| CalibError::Format(e.to_string())),
            DataFormat::Toml => {
                toml::to_string_pretty(value).map_err(|e| CalibError::Format(e.to_string()))
            }
        }
    }

    pub fn decode<T: DeserializeOwned>(self, text: &str) -> Result<T, CalibError> {
        match self {
            DataFormat::Json => {
                serde_json::from_str(text).map_err(|e| CalibError::Format(e.to_string()))
            }
            DataFormat::Toml => toml::from_str(text).map_err(|e| CalibError::Format(e.to_string())),
        }
    }

    pub fn save<T: Serialize>(self, value: &T, path: &Path) -> Result<()> {
        let text = self
            .encode(value)
            .with_context(|| format!("serializing '{}'", path.display()))?;
        fs::write(path, text).map_err(|e| CalibError::io(path, e))?;
        Ok(())
    }

    pub fn load<T: DeserializeOwned>(self, path: &Path) -> Result<T> {
        let text = fs::read_to_string(path).map_err(|e| CalibError::io(path, e))?;
        let value = self
            .decode(&text)
            .with_context(|| format!("parsing '{}'", path.display()))?;
        Ok(value)
    }
}

/// Serde adapter for maps keyed by integers.
///
/// TOML only allows string keys, so keys are written as decimal strings in
/// every format.
pub mod u64_key_map {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S, V>(map: &BTreeMap<u64, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        V: Serialize,
    {
        let keyed: BTreeMap<String, &V> = map.iter().map(|(k, v)| (k.to_string(), v)).collect();
        keyed.serialize(serializer)
    }

    pub fn deserialize<'de, D, V>(deserializer: D) -> Result<BTreeMap<u64, V>, D::Error>
    where
        D: Deserializer<'de>,
        V: Deserialize<'de>,
    {
        let keyed = BTreeMap::<String, V>::deserialize(deserializer)?;
        keyed
            .into_iter()
            .map(|(k, v)| {
                k.parse::<u64>()
                    .map(|k| (k, v))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
