// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;
use thiserror::Error;

/// Failure to obtain or interpret a configuration value.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The key exists but its value does not fit the requested type.
    #[error("invalid value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// A provider could not load its source at all.
    #[error("{provider} configuration: {message}")]
    ProviderError { provider: String, message: String },
}

impl ConfigError {
    pub fn provider_error<P: fmt::Display, M: fmt::Display>(provider: P, message: M) -> Self {
        Self::ProviderError {
            provider: provider.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn invalid_value(key: &str, err: impl fmt::Display) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_culprit() {
        assert_eq!(
            ConfigError::invalid_value("server.port", "expected u16").to_string(),
            "invalid value for 'server.port': expected u16"
        );
        assert_eq!(
            ConfigError::provider_error("file", "gateway.ini: unsupported file format").to_string(),
            "file configuration: gateway.ini: unsupported file format"
        );
    }
}
