// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Landmark list loading and resolution.
//!
//! The list is a small CSV file, one landmark per line:
//!
//! ```text
//! # comment
//! host,port
//! ntp.example.org
//! 192.0.2.10,443
//! ```
//!
//! A line is skipped when blank, or when its first field is empty, starts
//! with `#`, or is the literal header `host`. The port defaults to 80.

use serde::Serialize;
use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 80;

#[derive(Debug, Error)]
pub enum LandmarkError {
    #[error("cannot read landmark list: {0}")]
    Io(#[from] std::io::Error),

    #[error("landmark list line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("cannot resolve landmark {host}: {reason}")]
    Resolution { host: String, reason: String },
}

/// A landmark as written in the list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Landmark {
    pub host: String,
    pub port: u16,
}

impl Landmark {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// Read and parse a landmark list file.
pub fn load_landmarks<P: AsRef<Path>>(path: P) -> Result<Vec<Landmark>, LandmarkError> {
    let text = std::fs::read_to_string(path)?;
    parse_landmarks(&text)
}

/// Parse landmark list text. Line numbers in errors are 1-based.
pub fn parse_landmarks(text: &str) -> Result<Vec<Landmark>, LandmarkError> {
    let mut landmarks = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        if raw.trim().is_empty() {
            continue;
        }

        let fields: Vec<&str> = raw.split(',').map(str::trim).collect();
        let host = fields[0];
        if host.is_empty() || host.starts_with('#') || host == "host" {
            continue;
        }

        let port = match fields.as_slice() {
            [_] => DEFAULT_PORT,
            [_, port] if port.is_empty() => DEFAULT_PORT,
            [_, port] => parse_port(port).ok_or_else(|| LandmarkError::Parse {
                line,
                reason: format!("invalid port {port:?}"),
            })?,
            _ => {
                return Err(LandmarkError::Parse {
                    line,
                    reason: format!("expected host or host,port; got {} fields", fields.len()),
                })
            }
        };

        landmarks.push(Landmark::new(host, port));
    }

    Ok(landmarks)
}

fn parse_port(s: &str) -> Option<u16> {
    s.parse::<u16>().ok().filter(|p| *p != 0)
}

/// Resolve every landmark to an IPv4 socket address, in list order.
///
/// Fails on the first host that does not resolve to any IPv4 address.
pub fn resolve_landmarks(landmarks: &[Landmark]) -> Result<Vec<SocketAddrV4>, LandmarkError> {
    landmarks.iter().map(resolve_one).collect()
}

fn resolve_one(landmark: &Landmark) -> Result<SocketAddrV4, LandmarkError> {
    let addrs = (landmark.host.as_str(), landmark.port)
        .to_socket_addrs()
        .map_err(|e| LandmarkError::Resolution {
            host: landmark.host.clone(),
            reason: e.to_string(),
        })?;

    addrs
        .into_iter()
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| LandmarkError::Resolution {
            host: landmark.host.clone(),
            reason: "no IPv4 address".into(),
        })
        .inspect(|addr| tracing::trace!("resolved {} -> {}", landmark.host, addr))
}
