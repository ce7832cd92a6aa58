// Copyright (c) 2025 ADBC Drivers Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! String-keyed reader options.
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `cloudfetch.enabled` | true | Accept results delivered through external links |
//! | `cloudfetch.max_concurrent_downloads` | 16 | Download workers (also bounds chunks in memory) |
//! | `cloudfetch.max_retries` | 5 | Download attempts per chunk |
//! | `cloudfetch.retry_delay_ms` | 1500 | Delay between attempts |
//! | `cloudfetch.speed_threshold_mbps` | 0.1 | Slow download warning threshold |
//! | `http.connect_timeout_ms` | 30000 | Connect timeout for chunk downloads |
//! | `http.read_timeout_ms` | 60000 | Whole-request timeout for chunk downloads |
//! | `log_level` | unset | `OFF`, `ERROR`, `WARN`, `INFO`, `DEBUG`, `TRACE` |
//! | `log_file` | unset | Log file path; stderr when unset |

use crate::client::HttpClientConfig;
use crate::error::{Error, Result};
use crate::types::cloudfetch::CloudFetchConfig;
use std::time::Duration;

const LOG_LEVELS: [&str; 6] = ["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"];

/// Options for [`ResultReaderFactory`](crate::reader::ResultReaderFactory)
/// and [`HttpChunkFetcher`](crate::client::HttpChunkFetcher).
#[derive(Debug, Clone, Default)]
pub struct ReaderOptions {
    pub cloudfetch: CloudFetchConfig,
    pub http: HttpClientConfig,
    pub log_level: Option<String>,
    pub log_file: Option<String>,
}

impl ReaderOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build options from `(key, value)` pairs, failing on the first bad one.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut options = Self::default();
        for (key, value) in pairs {
            options.set_option(key, value)?;
        }
        Ok(options)
    }

    pub fn set_option(&mut self, key: &str, value: &str) -> Result<()> {
        let invalid = || Error::invalid_option(key, value);

        match key {
            "cloudfetch.enabled" => {
                self.cloudfetch.enabled = parse_bool_option(value).ok_or_else(invalid)?;
            }
            "cloudfetch.max_concurrent_downloads" => {
                self.cloudfetch.max_concurrent_downloads = parse_positive_option(value)
                    .ok_or_else(invalid)?
                    as usize;
            }
            "cloudfetch.max_retries" => {
                self.cloudfetch.max_retries =
                    parse_positive_option(value).ok_or_else(invalid)? as u32;
            }
            "cloudfetch.retry_delay_ms" => {
                self.cloudfetch.retry_delay = parse_millis_option(value).ok_or_else(invalid)?;
            }
            "cloudfetch.speed_threshold_mbps" => {
                self.cloudfetch.speed_threshold_mbps = value
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite() && *v >= 0.0)
                    .ok_or_else(invalid)?;
            }
            "http.connect_timeout_ms" => {
                self.http.connect_timeout = parse_millis_option(value).ok_or_else(invalid)?;
            }
            "http.read_timeout_ms" => {
                self.http.read_timeout = parse_millis_option(value).ok_or_else(invalid)?;
            }
            "log_level" => {
                let level = value.to_uppercase();
                if !LOG_LEVELS.contains(&level.as_str()) {
                    return Err(invalid());
                }
                self.log_level = Some(level);
            }
            "log_file" => {
                if value.is_empty() {
                    return Err(invalid());
                }
                self.log_file = Some(value.to_string());
            }
            _ => return Err(invalid()),
        }
        Ok(())
    }

    /// Current value of `key`, in the same format `set_option` accepts.
    /// Unset optional values read back as `None`.
    pub fn get_option(&self, key: &str) -> Result<Option<String>> {
        let value = match key {
            "cloudfetch.enabled" => Some(self.cloudfetch.enabled.to_string()),
            "cloudfetch.max_concurrent_downloads" => {
                Some(self.cloudfetch.max_concurrent_downloads.to_string())
            }
            "cloudfetch.max_retries" => Some(self.cloudfetch.max_retries.to_string()),
            "cloudfetch.retry_delay_ms" => {
                Some(self.cloudfetch.retry_delay.as_millis().to_string())
            }
            "cloudfetch.speed_threshold_mbps" => {
                Some(self.cloudfetch.speed_threshold_mbps.to_string())
            }
            "http.connect_timeout_ms" => Some(self.http.connect_timeout.as_millis().to_string()),
            "http.read_timeout_ms" => Some(self.http.read_timeout.as_millis().to_string()),
            "log_level" => self.log_level.clone(),
            "log_file" => self.log_file.clone(),
            _ => return Err(Error::invalid_option(key, "")),
        };
        Ok(value)
    }
}

/// Parse a boolean option value.
fn parse_bool_option(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Parse an integer option value that must be at least 1.
fn parse_positive_option(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok().filter(|v| *v >= 1 && *v <= u32::MAX as u64)
}

fn parse_millis_option(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_millis)
}
