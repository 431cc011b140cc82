// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Landmark round-trip latency client.
//!
//! Measures TCP connection round-trip times from this machine to a list of
//! landmarks, as input to active geolocation of hosts and proxies. The
//! timed connections themselves are made by an external native helper,
//! probe-core; this crate schedules the work, hands it over through a
//! shared memory buffer, keeps re-running the helper until the batch is
//! done, and records the results.
//!
//! # Pipeline
//!
//! ```text
//! landmarks.csv --> resolve --> choose_probe_order --> SharedWorkBuffer
//!                                                          |
//!                          ProbeRunner (<= 5 helper cycles)|
//!                                                          v
//!                         ResultRecorder <-- decode <-- probe-core
//! ```
//!
//! # Quick Start
//!
//! ```bash
//! # Three probes per landmark, location unknown
//! landmark-rtt landmarks.csv --n-probes 3 --location-unknown
//!
//! # Through a SOCKS5 proxy whose location is known
//! landmark-rtt landmarks.csv --location 50.85,4.35 \
//!     --socks5 198.51.100.4:1080 --proxy-location 52.52,13.40
//!
//! # Using a config file
//! landmark-rtt landmarks.csv --config probe.toml
//! ```

pub mod config;
pub mod error;
pub mod landmarks;
pub mod limits;
pub mod recorder;
pub mod runner;
pub mod schedule;
pub mod shm;

pub use config::{ConfigError, Location, ProbeConfig, ProxySetting};
pub use error::{Error, Result};
pub use landmarks::{load_landmarks, parse_landmarks, resolve_landmarks, Landmark, LandmarkError};
pub use limits::{apply_fd_ceiling, fd_ceiling, resolve_parallelism, FdLimits, ProcessLimits};
pub use recorder::{RecordError, ResultDocument, ResultRecorder, RunSummary};
pub use runner::{
    ContractViolation, Helper, HelperExit, HelperLaunchError, IncompleteProbeError, ProbeOutcome,
    ProbeRunner, ProcessHelper, RunSettings, RunState, RunnerError, MAX_CYCLES,
};
pub use schedule::{choose_probe_order, distinct_hosts};
pub use shm::{ErrorCode, ProbeResult, SharedWorkBuffer, ShmError};
