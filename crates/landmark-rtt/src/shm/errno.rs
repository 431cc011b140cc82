// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Symbolic names for the errno values probe-core reports per connection.

use serde::{Serialize, Serializer};
use std::fmt;

/// errno values probe-core can plausibly report for a TCP connect attempt,
/// plus the common process-level failures. First match wins.
const ERRNO_NAMES: &[(libc::c_int, &str)] = &[
    (libc::EPERM, "EPERM"),
    (libc::ENOENT, "ENOENT"),
    (libc::EINTR, "EINTR"),
    (libc::EIO, "EIO"),
    (libc::EBADF, "EBADF"),
    (libc::EAGAIN, "EAGAIN"),
    (libc::ENOMEM, "ENOMEM"),
    (libc::EACCES, "EACCES"),
    (libc::EFAULT, "EFAULT"),
    (libc::EINVAL, "EINVAL"),
    (libc::ENFILE, "ENFILE"),
    (libc::EMFILE, "EMFILE"),
    (libc::EPIPE, "EPIPE"),
    (libc::EPROTO, "EPROTO"),
    (libc::EPROTONOSUPPORT, "EPROTONOSUPPORT"),
    (libc::EAFNOSUPPORT, "EAFNOSUPPORT"),
    (libc::EADDRINUSE, "EADDRINUSE"),
    (libc::EADDRNOTAVAIL, "EADDRNOTAVAIL"),
    (libc::ENETDOWN, "ENETDOWN"),
    (libc::ENETUNREACH, "ENETUNREACH"),
    (libc::ENETRESET, "ENETRESET"),
    (libc::ECONNABORTED, "ECONNABORTED"),
    (libc::ECONNRESET, "ECONNRESET"),
    (libc::ENOBUFS, "ENOBUFS"),
    (libc::EISCONN, "EISCONN"),
    (libc::ENOTCONN, "ENOTCONN"),
    (libc::ETIMEDOUT, "ETIMEDOUT"),
    (libc::ECONNREFUSED, "ECONNREFUSED"),
    (libc::EHOSTDOWN, "EHOSTDOWN"),
    (libc::EHOSTUNREACH, "EHOSTUNREACH"),
    (libc::EALREADY, "EALREADY"),
    (libc::EINPROGRESS, "EINPROGRESS"),
];

/// Look up the symbolic errno name for `code`.
#[must_use]
pub fn errno_name(code: u32) -> Option<&'static str> {
    let code = libc::c_int::try_from(code).ok()?;
    ERRNO_NAMES
        .iter()
        .find(|(value, _)| *value == code)
        .map(|(_, name)| *name)
}

/// Decoded outcome of one connection attempt.
///
/// Serializes as the symbolic name when one is known, otherwise as the
/// raw integer (so success is `0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Code 0: the connection completed (or the record was never run).
    Success,
    /// A recognised errno value.
    Named(&'static str),
    /// A code with no known name.
    Raw(u32),
}

impl ErrorCode {
    #[must_use]
    pub fn from_raw(code: u32) -> Self {
        if code == 0 {
            return Self::Success;
        }
        errno_name(code).map_or(Self::Raw(code), Self::Named)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "0"),
            Self::Named(name) => write!(f, "{name}"),
            Self::Raw(code) => write!(f, "{code}"),
        }
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Success => serializer.serialize_u32(0),
            Self::Named(name) => serializer.serialize_str(name),
            Self::Raw(code) => serializer.serialize_u32(*code),
        }
    }
}
