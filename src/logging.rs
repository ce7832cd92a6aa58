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

//! Logging for CloudFetch result retrieval.
//!
//! Every link-based result runs its scheduler, download workers and link
//! fetch chain inside a `cloudfetch` span carrying the statement id, and
//! each download inside a `chunk` span carrying the chunk index, so
//! interleaved output from concurrent results stays attributable.
//!
//! The filter comes from, in order: the `log_level` reader option, then
//! `RUST_LOG`, then `databricks_cloudfetch=warn`.
//!
//! ```bash
//! RUST_LOG=databricks_cloudfetch=debug ./my_app
//! ```

use std::sync::OnceLock;
use tracing::Span;
use tracing_subscriber::{
    fmt::{self, time::SystemTime, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

static LOGGING_INITIALIZED: OnceLock<()> = OnceLock::new();

const CRATE_TARGET: &str = "databricks_cloudfetch";

/// Logging configuration taken from [`ReaderOptions`](crate::options::ReaderOptions).
#[derive(Debug, Clone, Default)]
pub(crate) struct LogConfig {
    /// Log level: "OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE".
    pub level: Option<String>,
    /// Log file path. If unset, logs go to stderr.
    pub file: Option<String>,
}

/// Span for the whole download pipeline of one result.
pub(crate) fn result_span(statement_id: &str, total_chunks: i64) -> Span {
    tracing::info_span!("cloudfetch", statement_id = %statement_id, total_chunks)
}

/// Span for downloading one chunk, nested in the result span.
pub(crate) fn chunk_span(chunk_index: i64) -> Span {
    tracing::debug_span!("chunk", chunk_index)
}

/// `None` when logging is switched off.
fn build_filter(level: Option<&str>) -> Option<EnvFilter> {
    match level {
        Some(level) if level.eq_ignore_ascii_case("off") => None,
        Some(level) => Some(EnvFilter::new(format!(
            "{}={}",
            CRATE_TARGET,
            level.to_lowercase()
        ))),
        None => Some(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("{}=warn", CRATE_TARGET))),
        ),
    }
}

/// Install the process-wide subscriber. Only the first call has an effect,
/// so the first `ResultReaderFactory` decides where logs go.
pub(crate) fn init_logging(config: &LogConfig) {
    LOGGING_INITIALIZED.get_or_init(|| {
        let Some(filter) = build_filter(config.level.as_deref()) else {
            return;
        };

        let (writer, ansi) = match &config.file {
            Some(path) => {
                match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                    Ok(file) => (BoxMakeWriter::new(std::sync::Mutex::new(file)), false),
                    Err(e) => {
                        eprintln!("databricks-cloudfetch: failed to open log file {}: {}", path, e);
                        return;
                    }
                }
            }
            None => (BoxMakeWriter::new(std::io::stderr), true),
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(false)
                    .with_timer(SystemTime),
            )
            .try_init()
            .ok();
    });
}
