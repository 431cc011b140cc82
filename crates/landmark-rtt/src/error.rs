// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-level error type.
//!
//! Everything here is fatal for a run. Recoverable conditions (a helper
//! cycle failing, the retry budget running out) are reported through
//! [`crate::runner::ProbeOutcome`] instead.

use crate::config::ConfigError;
use crate::landmarks::LandmarkError;
use crate::limits::LimitError;
use crate::recorder::RecordError;
use crate::runner::RunnerError;
use crate::shm::ShmError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("landmarks: {0}")]
    Landmark(#[from] LandmarkError),

    #[error("resource limits: {0}")]
    Limits(#[from] LimitError),

    #[error("shared memory: {0}")]
    Shm(#[from] ShmError),

    #[error("probe run: {0}")]
    Runner(#[from] RunnerError),

    #[error("result persistence: {0}")]
    Record(#[from] RecordError),
}

pub type Result<T> = std::result::Result<T, Error>;
