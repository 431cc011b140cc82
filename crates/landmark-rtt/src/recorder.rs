// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Result documents.
//!
//! One JSON document per run, written to `<dir>/<YYYY-MM-DD>-<n>.json`
//! with the first `n` that does not exist yet. Files are opened with
//! `create_new`, so an existing document is never overwritten, even by a
//! concurrent run.

use crate::config::{ConfigError, Location, ProbeConfig, ProxySetting};
use crate::landmarks::Landmark;
use crate::shm::ProbeResult;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Sequence numbers tried per date before giving up.
pub const MAX_FILENAME_ATTEMPTS: u32 = 10_000;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("no free result filename for {date} after {attempts} attempts in {dir}")]
    NoFreeFilename {
        dir: PathBuf,
        date: String,
        attempts: u32,
    },

    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Configuration fields that go into the document. Directories and other
/// local-only settings are left out.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub spacing: u32,
    pub timeout: u32,
    pub n_probes: u32,
    pub parallel: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<[f64; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_unknown: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_location: Option<[f64; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_location_unknown: Option<bool>,
}

impl RunSummary {
    /// Build from a validated configuration.
    pub fn from_config(config: &ProbeConfig) -> Result<Self, ConfigError> {
        let mut summary = Self {
            spacing: config.spacing,
            timeout: config.timeout,
            n_probes: config.n_probes,
            parallel: config.parallel,
            location: None,
            location_unknown: None,
            proxy: None,
            proxy_location: None,
            proxy_location_unknown: None,
        };

        match config.location()? {
            Location::Coordinates {
                latitude,
                longitude,
            } => summary.location = Some([latitude, longitude]),
            Location::Unknown => summary.location_unknown = Some(true),
        }

        if let ProxySetting::Socks5 {
            host,
            port,
            location,
        } = config.proxy_setting()?
        {
            summary.proxy = Some(format!("{host}:{port}"));
            match location {
                Location::Coordinates {
                    latitude,
                    longitude,
                } => summary.proxy_location = Some([latitude, longitude]),
                Location::Unknown => summary.proxy_location_unknown = Some(true),
            }
        }

        Ok(summary)
    }
}

/// The persisted document.
#[derive(Debug, Serialize)]
pub struct ResultDocument<'a> {
    #[serde(flatten)]
    pub summary: &'a RunSummary,
    pub results: &'a [ProbeResult],
    pub landmarks: &'a [Landmark],
    pub timestamp: DateTime<Utc>,
}

/// Writes result documents into one directory.
#[derive(Debug, Clone)]
pub struct ResultRecorder {
    dir: PathBuf,
    max_attempts: u32,
}

impl ResultRecorder {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            max_attempts: MAX_FILENAME_ATTEMPTS,
        }
    }

    /// Lower the collision budget (tests).
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Persist `doc`; returns the path written.
    ///
    /// A document that fails half-way is removed again, so its sequence
    /// number stays free.
    pub fn record(&self, doc: &ResultDocument<'_>) -> Result<PathBuf, RecordError> {
        let (path, file) = self.create_unique(&doc.timestamp)?;
        write_or_remove(&path, file, doc)?;

        tracing::info!(
            "wrote {} results for {} landmarks to {}",
            doc.results.len(),
            doc.landmarks.len(),
            path.display()
        );
        Ok(path)
    }

    fn create_unique(&self, timestamp: &DateTime<Utc>) -> Result<(PathBuf, File), RecordError> {
        let date = timestamp.format("%Y-%m-%d").to_string();

        for n in 0..self.max_attempts {
            let path = self.dir.join(format!("{date}-{n}.json"));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(source) => return Err(RecordError::Write { path, source }),
            }
        }

        Err(RecordError::NoFreeFilename {
            dir: self.dir.clone(),
            date,
            attempts: self.max_attempts,
        })
    }
}

fn write_or_remove<T: Serialize + ?Sized>(
    path: &Path,
    file: File,
    value: &T,
) -> Result<(), RecordError> {
    let result = write_json(path, file, value);
    if result.is_err() {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!("cannot remove partial document {}: {}", path.display(), e);
        }
    }
    result
}

fn write_json<T: Serialize + ?Sized>(path: &Path, file: File, value: &T) -> Result<(), RecordError> {
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer
        .write_all(b"\n")
        .and_then(|()| writer.flush())
        .map_err(|source| RecordError::Write {
            path: path.to_path_buf(),
            source,
        })
}
