// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Drives probe-core to completion over a shared work buffer.
//!
//! # State Machine
//!
//! ```text
//!   Init --> Encoded --> Running --+--> Complete
//!                          ^       |
//!                          |       +--> Retry --+
//!                          |                    |
//!                          +--------------------+
//!                                  |
//!                                  +--> Aborted  (cycle budget spent, or counter corrupted)
//! ```
//!
//! Each cycle runs the helper once against the *same* buffer and blocks
//! until it exits. Whatever the exit status, the controller then looks at
//! `processed_count`: probe-core writes results as it goes, so a crashed
//! run may still have made progress. The buffer is never re-encoded
//! between cycles; probe-core is expected to skip records it already
//! completed.
//!
//! Aborted is a soft failure. The partial results are decoded and returned
//! like any other, with unfinished records left zeroed.
//!
//! `processed_count` may only grow and never past the total. A helper that
//! breaks either rule aborts the batch at once, without further cycles; the
//! outcome records the violation and the last trustworthy count.

use crate::config::{ConfigError, ProbeConfig, ProxySetting};
use crate::limits::{apply_fd_ceiling, FdLimits, LimitError};
use crate::schedule::distinct_hosts;
use crate::shm::{ProbeResult, SharedWorkBuffer, ShmError};
use std::fmt;
use std::io;
use std::net::SocketAddrV4;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::Instant;
use thiserror::Error;

/// Helper invocations per batch before giving up.
pub const MAX_CYCLES: u32 = 5;

/// Fatal runner errors.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("work buffer: {0}")]
    Buffer(#[from] ShmError),

    #[error("resource limits: {0}")]
    Limits(#[from] LimitError),
}

/// A helper run that did not end cleanly. Logged, then retried.
#[derive(Debug, Error)]
pub enum HelperLaunchError {
    #[error("probe-core cycle {cycle} exited with status {code}")]
    Exited { cycle: u32, code: i32 },

    #[error("probe-core cycle {cycle} killed by signal {signal}")]
    Signaled { cycle: u32, signal: i32 },

    #[error("probe-core cycle {cycle} could not be started: {source}")]
    Spawn {
        cycle: u32,
        #[source]
        source: io::Error,
    },
}

/// The retry budget ran out with work left over. Soft: results are still
/// produced for the completed records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("probe incomplete after {cycles} cycles: {processed}/{total} connections processed")]
pub struct IncompleteProbeError {
    pub processed: u32,
    pub total: usize,
    pub cycles: u32,
}

impl IncompleteProbeError {
    #[must_use]
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        f64::from(self.processed) / self.total as f64
    }
}

/// The helper broke the `processed_count` contract. Ends the batch as
/// [`RunState::Aborted`]; whatever was filled is still decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContractViolation {
    #[error("probe-core cycle {cycle} reported {processed} processed connections out of {total}")]
    Overflow { cycle: u32, processed: u32, total: u32 },

    #[error("probe-core cycle {cycle} rolled processed_count back from {previous} to {current}")]
    Rollback {
        cycle: u32,
        previous: u32,
        current: u32,
    },
}

/// How a helper process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperExit {
    Success,
    Failed(i32),
    Signaled(i32),
}

impl From<ExitStatus> for HelperExit {
    fn from(status: ExitStatus) -> Self {
        if status.success() {
            Self::Success
        } else if let Some(code) = status.code() {
            Self::Failed(code)
        } else {
            Self::Signaled(status.signal().unwrap_or(0))
        }
    }
}

/// Runs one helper cycle against the buffer and waits for it to finish.
pub trait Helper {
    /// # Errors
    ///
    /// Returns the I/O error if the helper could not be started at all.
    fn invoke(&mut self, buffer: &mut SharedWorkBuffer, cycle: u32) -> io::Result<HelperExit>;
}

/// probe-core as a child process, the buffer descriptor as its stdin.
#[derive(Debug, Clone)]
pub struct ProcessHelper {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessHelper {
    /// Any program and argument list; the buffer still arrives on stdin.
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Direct-connect variant.
    pub fn direct(program: impl Into<PathBuf>) -> Self {
        Self::new(program, Vec::<String>::new())
    }

    /// SOCKS5 variant: proxy host and port become trailing arguments.
    pub fn socks5(program: impl Into<PathBuf>, proxy_host: &str, proxy_port: u16) -> Self {
        Self::new(program, [proxy_host.to_string(), proxy_port.to_string()])
    }

    /// Select the variant the configuration asks for.
    pub fn from_config(config: &ProbeConfig) -> Result<Self, ConfigError> {
        let program = config.helper_program()?;
        Ok(match config.proxy_setting()? {
            ProxySetting::Direct => Self::direct(program),
            ProxySetting::Socks5 { host, port, .. } => Self::socks5(program, &host, port),
        })
    }

    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl Helper for ProcessHelper {
    fn invoke(&mut self, buffer: &mut SharedWorkBuffer, cycle: u32) -> io::Result<HelperExit> {
        let stdin = buffer.stdin_handle().map_err(io::Error::other)?;

        tracing::debug!(
            "cycle {}: spawning {} {:?}",
            cycle,
            self.program.display(),
            self.args
        );
        let status = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::from(stdin))
            .status()?;
        Ok(HelperExit::from(status))
    }
}

/// Runner state; also the entries of the transition log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Encoded,
    Running { cycle: u32 },
    Retry { cycle: u32 },
    Complete,
    Aborted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "INIT"),
            Self::Encoded => write!(f, "ENCODED"),
            Self::Running { cycle } => write!(f, "RUNNING({cycle})"),
            Self::Retry { cycle } => write!(f, "RETRY({cycle})"),
            Self::Complete => write!(f, "COMPLETE"),
            Self::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Timing parameters of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSettings {
    pub spacing_ms: u32,
    pub timeout_ms: u32,
    /// 0 = as many as the fd limit allows.
    pub parallel: u32,
    pub max_cycles: u32,
}

impl RunSettings {
    #[must_use]
    pub fn from_config(config: &ProbeConfig) -> Self {
        Self {
            spacing_ms: config.spacing,
            timeout_ms: config.timeout,
            parallel: config.parallel,
            max_cycles: MAX_CYCLES,
        }
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    /// [`RunState::Complete`] or [`RunState::Aborted`].
    pub state: RunState,
    pub transitions: Vec<RunState>,
    pub results: Vec<ProbeResult>,
    pub processed: u32,
    pub total: usize,
    pub cycles: u32,
    pub helper_failures: u32,
    pub fd_ceiling: u64,
    /// Set when the helper corrupted `processed_count`; `processed` then
    /// holds the last count that was still valid.
    pub contract_violation: Option<ContractViolation>,
}

impl ProbeOutcome {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state == RunState::Complete
    }

    /// Number of retry transitions taken.
    #[must_use]
    pub fn retries(&self) -> usize {
        self.transitions
            .iter()
            .filter(|s| matches!(s, RunState::Retry { .. }))
            .count()
    }

    /// The soft failure to report, if the batch did not finish.
    #[must_use]
    pub fn incomplete(&self) -> Option<IncompleteProbeError> {
        (self.state == RunState::Aborted).then_some(IncompleteProbeError {
            processed: self.processed,
            total: self.total,
            cycles: self.cycles,
        })
    }
}

/// Allocates, encodes, runs the helper until done or out of cycles, and
/// decodes. One runner drives one batch at a time.
pub struct ProbeRunner<H, L> {
    helper: H,
    limits: L,
    settings: RunSettings,
}

impl<H: Helper, L: FdLimits> ProbeRunner<H, L> {
    pub fn new(helper: H, limits: L, settings: RunSettings) -> Self {
        Self {
            helper,
            limits,
            settings,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Run the batch `work` (already in probe order).
    ///
    /// The shared buffer is released before this returns, on every path.
    ///
    /// # Errors
    ///
    /// Fails if the fd limit cannot be applied or the buffer cannot be
    /// allocated. Helper exit failures, an exhausted retry budget and a
    /// corrupted progress counter end in an outcome, not an error.
    pub fn run(&mut self, work: &[SocketAddrV4]) -> Result<ProbeOutcome, RunnerError> {
        let mut transitions = vec![RunState::Init];
        let hosts = distinct_hosts(work);
        let fd_ceiling = apply_fd_ceiling(&mut self.limits, hosts, self.settings.parallel)?;

        // Dropped (unmapped and closed) on every return below.
        let mut buffer = SharedWorkBuffer::allocate(work.len())?;
        buffer.encode(work, self.settings.spacing_ms, self.settings.timeout_ms)?;
        transitions.push(RunState::Encoded);

        let started = Instant::now();
        let total = buffer.total();
        let mut cycles = 0;
        let mut helper_failures = 0;
        let mut last_processed = 0;
        let mut contract_violation = None;

        let state = if buffer.check_completion()? {
            RunState::Complete
        } else {
            loop {
                cycles += 1;
                transitions.push(RunState::Running { cycle: cycles });

                if let Some(err) = self.run_cycle(&mut buffer, cycles) {
                    helper_failures += 1;
                    tracing::warn!("{}", err);
                }

                match Self::checked_progress(&buffer, cycles, last_processed)? {
                    Ok(processed) => last_processed = processed,
                    Err(violation) => {
                        tracing::error!("helper contract violated: {}", violation);
                        contract_violation = Some(violation);
                        break RunState::Aborted;
                    }
                }
                tracing::info!(
                    "cycle {}: {}/{} connections processed",
                    cycles,
                    last_processed,
                    total
                );

                if last_processed as usize == total {
                    break RunState::Complete;
                }
                if cycles < self.settings.max_cycles {
                    transitions.push(RunState::Retry { cycle: cycles });
                    continue;
                }
                break RunState::Aborted;
            }
        };
        transitions.push(state);

        let results = buffer.decode()?;
        let processed = last_processed;
        buffer.release();

        tracing::info!(
            "probe {} after {} cycle(s) in {:.2}s: {}/{} processed",
            state,
            cycles,
            started.elapsed().as_secs_f64(),
            processed,
            total
        );

        Ok(ProbeOutcome {
            state,
            transitions,
            results,
            processed,
            total,
            cycles,
            helper_failures,
            fd_ceiling,
            contract_violation,
        })
    }

    /// Read `processed_count` after a cycle. The outer error is fatal (the
    /// buffer is gone); the inner one is a helper breaking the counter rules.
    fn checked_progress(
        buffer: &SharedWorkBuffer,
        cycle: u32,
        previous: u32,
    ) -> Result<Result<u32, ContractViolation>, RunnerError> {
        let current = match buffer.processed() {
            Ok(current) => current,
            Err(ShmError::ProgressOverflow { processed, total }) => {
                return Ok(Err(ContractViolation::Overflow {
                    cycle,
                    processed,
                    total,
                }))
            }
            Err(e) => return Err(e.into()),
        };
        if current < previous {
            return Ok(Err(ContractViolation::Rollback {
                cycle,
                previous,
                current,
            }));
        }
        Ok(Ok(current))
    }

    fn run_cycle(&mut self, buffer: &mut SharedWorkBuffer, cycle: u32) -> Option<HelperLaunchError> {
        match self.helper.invoke(buffer, cycle) {
            Ok(HelperExit::Success) => None,
            Ok(HelperExit::Failed(code)) => Some(HelperLaunchError::Exited { cycle, code }),
            Ok(HelperExit::Signaled(signal)) => Some(HelperLaunchError::Signaled { cycle, signal }),
            Err(source) => Some(HelperLaunchError::Spawn { cycle, source }),
        }
    }
}
