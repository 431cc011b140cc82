// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Open-file-descriptor ceiling for probe-core.
//!
//! probe-core inherits this process's `RLIMIT_NOFILE`, and that limit is
//! what bounds how many connection attempts it can keep open at once. The
//! soft limit is set once before the first helper run and never restored.

use std::io;
use thiserror::Error;

/// Floor for the soft limit, whatever the batch size.
pub const MIN_FD_CEILING: u64 = 16;

/// Descriptors probe-core needs besides its sockets (stdin buffer, stdout, stderr).
pub const RESERVED_FDS: u64 = 3;

#[derive(Debug, Error)]
pub enum LimitError {
    #[error("getrlimit(RLIMIT_NOFILE) failed: {0}")]
    Get(#[source] io::Error),

    #[error("setrlimit(RLIMIT_NOFILE, {target}) failed: {source}")]
    Set {
        target: u64,
        #[source]
        source: io::Error,
    },
}

/// Access to the descriptor limit; swapped out in tests so the test
/// process keeps its own limit.
pub trait FdLimits {
    /// Hard `RLIMIT_NOFILE`.
    ///
    /// # Errors
    ///
    /// Returns [`LimitError::Get`] if the limit cannot be read.
    fn hard_limit(&self) -> Result<u64, LimitError>;

    /// Set the soft limit, leaving the hard limit unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`LimitError::Set`] if the kernel rejects the value.
    fn set_soft_limit(&mut self, soft: u64) -> Result<(), LimitError>;
}

/// The real limits of the current process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLimits;

impl ProcessLimits {
    fn get() -> Result<libc::rlimit, LimitError> {
        let mut rlim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: rlim is a valid, writable rlimit struct for the duration of the call.
        let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) };
        if ret != 0 {
            return Err(LimitError::Get(io::Error::last_os_error()));
        }
        Ok(rlim)
    }
}

impl FdLimits for ProcessLimits {
    fn hard_limit(&self) -> Result<u64, LimitError> {
        Ok(rlim_to_u64(Self::get()?.rlim_max))
    }

    fn set_soft_limit(&mut self, soft: u64) -> Result<(), LimitError> {
        let mut rlim = Self::get()?;
        rlim.rlim_cur = libc::rlim_t::try_from(soft).unwrap_or(rlim.rlim_max);
        // SAFETY: rlim is a fully initialised rlimit struct; setrlimit only reads it.
        let ret = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) };
        if ret != 0 {
            return Err(LimitError::Set {
                target: soft,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

#[allow(clippy::unnecessary_cast)]
fn rlim_to_u64(value: libc::rlim_t) -> u64 {
    if value == libc::RLIM_INFINITY {
        u64::MAX
    } else {
        value as u64
    }
}

/// Effective parallelism: `0` means "as much as the hard limit allows",
/// anything above the hard limit is clamped to it.
#[must_use]
pub fn resolve_parallelism(requested: u32, hard_limit: u64) -> u64 {
    if requested == 0 {
        hard_limit
    } else {
        u64::from(requested).min(hard_limit)
    }
}

/// Soft limit for a batch: `max(16, min(hosts, parallelism) + 3)`, never
/// above the hard limit.
#[must_use]
pub fn fd_ceiling(distinct_hosts: usize, parallel: u32, hard_limit: u64) -> u64 {
    let parallelism = resolve_parallelism(parallel, hard_limit);
    let hosts = u64::try_from(distinct_hosts).unwrap_or(u64::MAX);
    hosts
        .min(parallelism)
        .saturating_add(RESERVED_FDS)
        .max(MIN_FD_CEILING)
        .min(hard_limit)
}

/// Compute and apply the soft limit for a batch. Returns the value set.
///
/// # Errors
///
/// Propagates failures reading or setting the limit.
pub fn apply_fd_ceiling<L: FdLimits + ?Sized>(
    limits: &mut L,
    distinct_hosts: usize,
    parallel: u32,
) -> Result<u64, LimitError> {
    let hard = limits.hard_limit()?;
    let ceiling = fd_ceiling(distinct_hosts, parallel, hard);
    limits.set_soft_limit(ceiling)?;
    tracing::debug!(
        "RLIMIT_NOFILE soft limit set to {} (hosts {}, parallel {}, hard {})",
        ceiling,
        distinct_hosts,
        parallel,
        hard
    );
    Ok(ceiling)
}
