// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! JSON, TOML and YAML configuration files.

use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

use super::ConfigError;
use super::ConfigProvider;

/// Formats a gateway configuration file may be written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Json,
    Toml,
    Yaml,
}

impl FileFormat {
    /// `.json`, `.toml`, `.yaml` or `.yml`, case-insensitive.
    pub fn from_extension(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_string_lossy().to_ascii_lowercase();
        match ext.as_str() {
            "json" => Some(Self::Json),
            "toml" => Some(Self::Toml),
            "yaml" | "yml" => Some(Self::Yaml),
            _ => None,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Json => "JSON",
            Self::Toml => "TOML",
            Self::Yaml => "YAML",
        }
    }

    /// Parse a document into a JSON tree; the root must be a table.
    pub fn parse(self, content: &str) -> Result<Map<String, Value>, String> {
        let tree = match self {
            Self::Json => serde_json::from_str::<Value>(content).map_err(|e| e.to_string()),
            Self::Toml => toml::from_str::<toml::Value>(content)
                .map_err(|e| e.to_string())
                .and_then(|v| serde_json::to_value(v).map_err(|e| e.to_string())),
            Self::Yaml => serde_yaml::from_str::<serde_yaml::Value>(content)
                .map_err(|e| e.to_string())
                .and_then(|v| serde_json::to_value(v).map_err(|e| e.to_string())),
        }
        .map_err(|e| format!("invalid {}: {e}", self.label()))?;

        match tree {
            Value::Object(map) => Ok(map),
            _ => Err(format!("{} root must be a table", self.label())),
        }
    }
}

/// Reads one configuration file at construction.
///
/// Reloading builds a fresh provider, so a half-written file never leaks
/// into a running gateway.
#[derive(Debug)]
pub struct FileConfigProvider {
    data: Map<String, Value>,
}

impl FileConfigProvider {
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        let path = PathBuf::from(path);
        let format = FileFormat::from_extension(&path).ok_or_else(|| {
            ConfigError::provider_error(
                "file",
                format!("{}: unsupported file format", path.display()),
            )
        })?;
        let content = fs::read_to_string(&path).map_err(|e| {
            ConfigError::provider_error("file", format!("failed to read {}: {e}", path.display()))
        })?;
        let data = format
            .parse(&content)
            .map_err(|e| ConfigError::provider_error("file", format!("{}: {e}", path.display())))?;

        Ok(Self { data })
    }

    /// Walk a dotted key; numeric segments index into arrays.
    fn lookup(&self, key: &str) -> Option<&Value> {
        let mut segments = key.split('.');
        let root = self.data.get(segments.next()?)?;
        segments.try_fold(root, |node, segment| match node {
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?),
            other => other.get(segment),
        })
    }
}

impl ConfigProvider for FileConfigProvider {
    fn has(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    fn provider_name(&self) -> &str {
        "file"
    }

    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        Ok(self.lookup(key).cloned())
    }
}
