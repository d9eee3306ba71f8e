/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::podpatcher::util::error::{new_error, BoxError};
use std::env;

/// Enum for supported configuration parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Config {
    FieldManager,
    ForceOwnership,
    LogFormat,
}

impl Config {
    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::FieldManager => "PODPATCHER_FIELD_MANAGER",
            Config::ForceOwnership => "PODPATCHER_FORCE_OWNERSHIP",
            Config::LogFormat => "PODPATCHER_LOG_FORMAT",
        }
    }

    pub fn default_value(&self) -> &'static str {
        match self {
            Config::FieldManager => "podpatcher",
            Config::ForceOwnership => "true",
            Config::LogFormat => "text",
        }
    }

    /// Returns the effective value, either from environment or default.
    /// Blank values are treated as unset.
    pub fn get(&self) -> String {
        env::var(self.env_var())
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| self.default_value().to_string())
    }

    /// Parses the effective value as a boolean flag.
    pub fn get_bool(&self) -> Result<bool, BoxError> {
        let value = self.get();
        match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(new_error(format!(
                "{} must be a boolean, got '{}'",
                self.env_var(),
                value
            ))),
        }
    }
}
