// Copyright 2019 Zhizhesihai (Beijing) Technology Limited.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

use error::ErrorKind::IllegalArgument;
use error::Result;

use num_cpus;
use serde_json;

use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Default value is 16 MB (which means flush when buffered docs consume
/// approximately 16 MB RAM.
pub const DEFAULT_RAM_BUFFER_SIZE_MB: f64 = 16.0;

/// Hard limit for a single per-thread buffer; a buffer growing beyond this is
/// flushed no matter what the `FlushPolicy` decides.
pub const DEFAULT_RAM_PER_THREAD_HARD_LIMIT_MB: u32 = 1945;

/// Upper bound (exclusive) of `per_thread_hard_limit_mb`.
pub const MAX_RAM_PER_THREAD_HARD_LIMIT_MB: u32 = 2048;

/// Indexing threads are stalled once the number of pending and flushing
/// buffers exceeds this factor times the number of active thread states.
pub const DEFAULT_STALL_RATIO: usize = 2;

/// Holds all the configuration that is used to create a `DocumentsWriter`.
///
/// Each of `max_buffered_docs`, `max_buffered_delete_terms` and
/// `ram_buffer_size_mb` enables one flush trigger when set; `None` disables
/// it. At least one trigger must be enabled, see `#validate()`.
///
/// The config can be built in code:
///
/// ```rust
/// use rucene_flush::core::index::writer::IndexWriterConfig;
///
/// let conf = IndexWriterConfig {
///     max_buffered_docs: Some(1024),
///     ram_buffer_size_mb: None,
///     ..IndexWriterConfig::default()
/// };
/// assert!(conf.validate().is_ok());
/// ```
///
/// or loaded from JSON via `#from_json()`, missing fields take the defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexWriterConfig {
    pub ram_buffer_size_mb: Option<f64>,
    pub max_buffered_delete_terms: Option<u32>,
    pub max_buffered_docs: Option<u32>,
    pub per_thread_hard_limit_mb: u32,
    /// Maximum number of `ThreadState`s the pool creates; further indexing
    /// threads block until a state is released.
    pub max_thread_states: usize,
    pub stall_ratio: usize,
}

impl Default for IndexWriterConfig {
    fn default() -> Self {
        IndexWriterConfig {
            ram_buffer_size_mb: Some(DEFAULT_RAM_BUFFER_SIZE_MB),
            max_buffered_delete_terms: None,
            max_buffered_docs: None,
            per_thread_hard_limit_mb: DEFAULT_RAM_PER_THREAD_HARD_LIMIT_MB,
            max_thread_states: num_cpus::get().max(1),
            stall_ratio: DEFAULT_STALL_RATIO,
        }
    }
}

impl IndexWriterConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let conf: IndexWriterConfig = serde_json::from_str(json)?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut content = String::new();
        File::open(path)?.read_to_string(&mut content)?;
        Self::from_json(&content)
    }

    /// Rejects configurations flush control can not work with. Without any
    /// trigger nothing would ever be flushed during indexing.
    pub fn validate(&self) -> Result<()> {
        if !self.flush_on_ram() && !self.flush_on_doc_count() && !self.flush_on_delete_terms() {
            bail!(IllegalArgument(
                "at least one of ram_buffer_size_mb, max_buffered_docs or \
                 max_buffered_delete_terms must be enabled"
                    .into()
            ));
        }
        if let Some(max_docs) = self.max_buffered_docs {
            if max_docs < 2 {
                bail!(IllegalArgument(format!(
                    "max_buffered_docs must at least be 2 when enabled, got {}",
                    max_docs
                )));
            }
        }
        if let Some(max_terms) = self.max_buffered_delete_terms {
            if max_terms < 1 {
                bail!(IllegalArgument(
                    "max_buffered_delete_terms must at least be 1 when enabled".into()
                ));
            }
        }
        if let Some(mb) = self.ram_buffer_size_mb {
            if !(mb > 0.0) || !mb.is_finite() {
                bail!(IllegalArgument(format!(
                    "ram_buffer_size_mb should be > 0.0 MB when enabled, got {}",
                    mb
                )));
            }
        }
        if self.per_thread_hard_limit_mb == 0
            || self.per_thread_hard_limit_mb >= MAX_RAM_PER_THREAD_HARD_LIMIT_MB
        {
            bail!(IllegalArgument(format!(
                "per_thread_hard_limit_mb must be greater than 0 and less than {}MB, got {}",
                MAX_RAM_PER_THREAD_HARD_LIMIT_MB, self.per_thread_hard_limit_mb
            )));
        }
        if self.max_thread_states == 0 {
            bail!(IllegalArgument("max_thread_states must be > 0".into()));
        }
        if self.stall_ratio == 0 {
            bail!(IllegalArgument("stall_ratio must be > 0".into()));
        }
        Ok(())
    }

    pub fn ram_buffer_size_mb(&self) -> f64 {
        let res = self.ram_buffer_size_mb.unwrap_or(0.0);
        debug_assert!(res >= 0.0);
        res
    }

    pub fn ram_buffer_size(&self) -> u64 {
        debug_assert!(self.ram_buffer_size_mb.is_some());
        (self.ram_buffer_size_mb() * 1024.0 * 1024.0) as u64
    }

    pub fn max_buffered_delete_terms(&self) -> u32 {
        self.max_buffered_delete_terms.unwrap_or(0)
    }

    pub fn max_buffered_docs(&self) -> u32 {
        self.max_buffered_docs.unwrap_or(0)
    }

    pub fn flush_on_delete_terms(&self) -> bool {
        self.max_buffered_delete_terms.is_some()
    }

    pub fn flush_on_ram(&self) -> bool {
        self.ram_buffer_size_mb.is_some()
    }

    pub fn flush_on_doc_count(&self) -> bool {
        self.max_buffered_docs.is_some()
    }

    pub fn per_thread_hard_limit(&self) -> u64 {
        self.per_thread_hard_limit_mb as u64 * 1024 * 1024
    }
}
