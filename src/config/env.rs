// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Environment variable-based configuration provider.
//!
//! `PORTCULLIS_PROXY_RETRY_MAX_RETRIES=3` answers the key
//! `proxy.retry.max_retries`: keys are compared with `.` and `_` treated
//! alike, case-insensitively.  Values are parsed as JSON when possible, so
//! whole sections can be supplied too (`PORTCULLIS_ROUTES='[...]'`).

use serde_json::{Value, json};
use std::collections::HashMap;
use std::env;

use super::ConfigError;
use super::ConfigProvider;

/// Configuration provider that reads prefixed environment variables.
#[derive(Debug)]
pub struct EnvConfigProvider {
    prefix: String,
    /// Normalized key → raw value
    cache: HashMap<String, String>,
}

impl EnvConfigProvider {
    pub fn new(prefix: &str) -> Self {
        let mut provider = Self {
            prefix: prefix.to_string(),
            cache: HashMap::new(),
        };
        provider.refresh_cache();
        provider
    }

    /// Re-read the process environment.
    pub fn refresh_cache(&mut self) {
        self.cache = env::vars()
            .filter_map(|(key, value)| {
                key.strip_prefix(&self.prefix)
                    .filter(|rest| !rest.is_empty())
                    .map(|rest| (normalize(rest), value))
            })
            .collect();
    }

    fn parse_value_to_json(value: &str) -> Value {
        if let Ok(json_value) = serde_json::from_str(value) {
            return json_value;
        }
        if value.eq_ignore_ascii_case("true") {
            return json!(true);
        }
        if value.eq_ignore_ascii_case("false") {
            return json!(false);
        }
        json!(value)
    }
}

fn normalize(key: &str) -> String {
    key.to_lowercase().replace('.', "_")
}

impl Default for EnvConfigProvider {
    fn default() -> Self {
        Self::new("PORTCULLIS_")
    }
}

impl ConfigProvider for EnvConfigProvider {
    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        Ok(self
            .cache
            .get(&normalize(key))
            .map(|value| Self::parse_value_to_json(value)))
    }

    fn has(&self, key: &str) -> bool {
        self.cache.contains_key(&normalize(key))
    }

    fn provider_name(&self) -> &str {
        "env"
    }
}
