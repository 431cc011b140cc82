// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Measurement configuration.
//!
//! Loaded from an optional TOML file, then overridden from the command line.
//! Every value is range-checked by [`ProbeConfig::validate`] before a run.
//!
//! ```toml
//! spacing = 10        # ms between connection attempts
//! timeout = 1000      # ms per attempt
//! n_probes = 3        # probes per landmark
//! parallel = 0        # 0 = as many as the fd limit allows
//!
//! location = [50.85, 4.35]
//!
//! proxy = "198.51.100.4:1080"
//! proxy_location_unknown = true
//! ```

use serde::{Deserialize, Serialize};
use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const MAX_TIMEOUT_MS: u32 = 60_000;
pub const MAX_PROBES: u32 = 20;

/// Executable names inside the helper directory.
pub const DIRECT_HELPER: &str = "probe-core-direct";
pub const SOCKS_HELPER: &str = "probe-core-socks";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Where a measurement point is, if known.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Location {
    Coordinates { latitude: f64, longitude: f64 },
    Unknown,
}

/// How probe-core reaches the landmarks.
#[derive(Debug, Clone, PartialEq)]
pub enum ProxySetting {
    Direct,
    Socks5 {
        host: String,
        port: u16,
        location: Location,
    },
}

/// Measurement configuration, as read from file and command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbeConfig {
    /// Milliseconds between connection attempts.
    #[serde(default = "default_spacing")]
    pub spacing: u32,

    /// Milliseconds before a connection attempt is abandoned.
    #[serde(default = "default_timeout")]
    pub timeout: u32,

    /// Probes per landmark.
    #[serde(default = "default_probes")]
    pub n_probes: u32,

    /// Concurrent connection attempts; 0 = as many as allowed.
    #[serde(default)]
    pub parallel: u32,

    /// `[latitude, longitude]` of the probing machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<[f64; 2]>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub location_unknown: bool,

    /// SOCKS5 proxy as `host:port`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_location: Option<[f64; 2]>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub proxy_location_unknown: bool,

    /// Directory holding the probe-core executables (default: next to
    /// this binary).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helper_dir: Option<PathBuf>,

    /// Directory for result documents.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_spacing() -> u32 {
    10
}

fn default_timeout() -> u32 {
    1000
}

fn default_probes() -> u32 {
    1
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            spacing: default_spacing(),
            timeout: default_timeout(),
            n_probes: default_probes(),
            parallel: 0,
            location: None,
            location_unknown: false,
            proxy: None,
            proxy_location: None,
            proxy_location_unknown: false,
            helper_dir: None,
            output_dir: default_output_dir(),
        }
    }
}

impl ProbeConfig {
    /// Load configuration from a TOML file. Not validated yet.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Range-check every value. `hard_fd_limit` bounds `parallel`.
    pub fn validate(&self, hard_fd_limit: u64) -> Result<(), ConfigError> {
        if self.timeout == 0 || self.timeout > MAX_TIMEOUT_MS {
            return Err(ConfigError::Invalid(format!(
                "timeout must be in [1, {MAX_TIMEOUT_MS}] ms, got {}",
                self.timeout
            )));
        }
        if self.spacing == 0 || self.spacing > self.timeout {
            return Err(ConfigError::Invalid(format!(
                "spacing must be in [1, timeout={}] ms, got {}",
                self.timeout, self.spacing
            )));
        }
        if self.n_probes == 0 || self.n_probes > MAX_PROBES {
            return Err(ConfigError::Invalid(format!(
                "n_probes must be in [1, {MAX_PROBES}], got {}",
                self.n_probes
            )));
        }
        if u64::from(self.parallel) > hard_fd_limit {
            return Err(ConfigError::Invalid(format!(
                "parallel must be in [0, {hard_fd_limit}] (hard fd limit), got {}",
                self.parallel
            )));
        }

        self.location()?;
        self.proxy_setting()?;
        Ok(())
    }

    /// The probing machine's location.
    pub fn location(&self) -> Result<Location, ConfigError> {
        match (self.location, self.location_unknown) {
            (Some(coords), false) => coordinates("location", coords),
            (None, true) => Ok(Location::Unknown),
            (Some(_), true) => Err(ConfigError::Invalid(
                "location and location_unknown are mutually exclusive".into(),
            )),
            (None, false) => Err(ConfigError::Invalid(
                "one of location or location_unknown is required".into(),
            )),
        }
    }

    /// Direct or SOCKS5, with the proxy's location.
    pub fn proxy_setting(&self) -> Result<ProxySetting, ConfigError> {
        let Some(ref endpoint) = self.proxy else {
            if self.proxy_location.is_some() || self.proxy_location_unknown {
                return Err(ConfigError::Invalid(
                    "proxy_location / proxy_location_unknown given without a proxy".into(),
                ));
            }
            return Ok(ProxySetting::Direct);
        };

        let (host, port) = parse_endpoint(endpoint)?;
        let location = match (self.proxy_location, self.proxy_location_unknown) {
            (Some(coords), false) => coordinates("proxy_location", coords)?,
            (None, true) => Location::Unknown,
            (Some(_), true) => {
                return Err(ConfigError::Invalid(
                    "proxy_location and proxy_location_unknown are mutually exclusive".into(),
                ))
            }
            (None, false) => {
                return Err(ConfigError::Invalid(
                    "a proxy needs one of proxy_location or proxy_location_unknown".into(),
                ))
            }
        };
        Ok(ProxySetting::Socks5 {
            host,
            port,
            location,
        })
    }

    /// Full path of the probe-core variant this configuration selects.
    pub fn helper_program(&self) -> Result<PathBuf, ConfigError> {
        let dir = match self.helper_dir {
            Some(ref dir) => dir.clone(),
            None => std::env::current_exe()?
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        let name = match self.proxy_setting()? {
            ProxySetting::Direct => DIRECT_HELPER,
            ProxySetting::Socks5 { .. } => SOCKS_HELPER,
        };
        Ok(dir.join(name))
    }
}

fn coordinates(field: &str, [latitude, longitude]: [f64; 2]) -> Result<Location, ConfigError> {
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return Err(ConfigError::Invalid(format!(
            "{field} out of range: [{latitude}, {longitude}]"
        )));
    }
    Ok(Location::Coordinates {
        latitude,
        longitude,
    })
}

/// Split `host:port`. Accepts a bare IPv4 socket address or `name:port`.
fn parse_endpoint(endpoint: &str) -> Result<(String, u16), ConfigError> {
    if let Ok(addr) = endpoint.parse::<SocketAddrV4>() {
        return Ok((addr.ip().to_string(), addr.port()));
    }
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::Invalid(format!("proxy must be host:port, got {endpoint}")))?;
    if host.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "proxy host is empty in {endpoint}"
        )));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("invalid proxy port in {endpoint}")))?;
    if port == 0 {
        return Err(ConfigError::Invalid(format!(
            "proxy port must be non-zero in {endpoint}"
        )));
    }
    Ok((host.to_string(), port))
}

/// Parse `lat,lon` as given on the command line.
pub fn parse_coordinates(s: &str) -> Result<[f64; 2], String> {
    let (lat, lon) = s
        .split_once(',')
        .ok_or_else(|| format!("expected LAT,LON, got {s}"))?;
    let lat: f64 = lat
        .trim()
        .parse()
        .map_err(|_| format!("invalid latitude: {lat}"))?;
    let lon: f64 = lon
        .trim()
        .parse()
        .map_err(|_| format!("invalid longitude: {lon}"))?;
    Ok([lat, lon])
}

#[cfg(test)]
mod tests {
    use super::*;

    const HARD: u64 = 1024;

    fn valid() -> ProbeConfig {
        ProbeConfig {
            location_unknown: true,
            ..ProbeConfig::default()
        }
    }

    #[test]
    fn test_defaults_valid() {
        let config = valid();
        assert!(config.validate(HARD).is_ok());
        assert_eq!(config.proxy_setting().expect("proxy"), ProxySetting::Direct);
    }

    #[test]
    fn test_timeout_range() {
        let mut config = valid();
        config.timeout = 0;
        assert!(config.validate(HARD).is_err());
        config.timeout = MAX_TIMEOUT_MS + 1;
        assert!(config.validate(HARD).is_err());
        config.timeout = MAX_TIMEOUT_MS;
        assert!(config.validate(HARD).is_ok());
    }

    #[test]
    fn test_spacing_bounded_by_timeout() {
        let mut config = valid();
        config.timeout = 100;
        config.spacing = 101;
        assert!(config.validate(HARD).is_err());
        config.spacing = 100;
        assert!(config.validate(HARD).is_ok());
        config.spacing = 0;
        assert!(config.validate(HARD).is_err());
    }

    #[test]
    fn test_probe_count_range() {
        let mut config = valid();
        config.n_probes = 0;
        assert!(config.validate(HARD).is_err());
        config.n_probes = 21;
        assert!(config.validate(HARD).is_err());
        config.n_probes = 20;
        assert!(config.validate(HARD).is_ok());
    }

    #[test]
    fn test_parallel_bounded_by_hard_limit() {
        let mut config = valid();
        config.parallel = 1025;
        assert!(config.validate(HARD).is_err());
        config.parallel = 1024;
        assert!(config.validate(HARD).is_ok());
        config.parallel = 0;
        assert!(config.validate(HARD).is_ok());
    }

    #[test]
    fn test_location_exactly_one() {
        let mut config = ProbeConfig::default();
        assert!(config.validate(HARD).is_err());

        config.location = Some([48.2, 16.37]);
        assert_eq!(
            config.location().expect("location"),
            Location::Coordinates {
                latitude: 48.2,
                longitude: 16.37
            }
        );

        config.location_unknown = true;
        assert!(config.location().is_err());

        config.location = Some([91.0, 0.0]);
        config.location_unknown = false;
        assert!(config.location().is_err());
    }

    #[test]
    fn test_proxy_setting() {
        let mut config = valid();
        config.proxy_location_unknown = true;
        assert!(config.validate(HARD).is_err()); // no proxy

        config.proxy = Some("proxy.example.net:1080".into());
        assert_eq!(
            config.proxy_setting().expect("proxy"),
            ProxySetting::Socks5 {
                host: "proxy.example.net".into(),
                port: 1080,
                location: Location::Unknown,
            }
        );

        config.proxy_location = Some([0.0, 0.0]);
        assert!(config.proxy_setting().is_err()); // both given

        config.proxy_location_unknown = false;
        assert!(config.validate(HARD).is_ok());

        config.proxy_location = None;
        assert!(config.proxy_setting().is_err()); // neither given
    }

    #[test]
    fn test_proxy_endpoint_parsing() {
        assert_eq!(
            parse_endpoint("192.0.2.5:9050").expect("parse"),
            ("192.0.2.5".to_string(), 9050)
        );
        assert!(parse_endpoint("noport").is_err());
        assert!(parse_endpoint(":1080").is_err());
        assert!(parse_endpoint("host:0").is_err());
        assert!(parse_endpoint("host:99999").is_err());
    }

    #[test]
    fn test_helper_program_variant() {
        let mut config = valid();
        config.helper_dir = Some(PathBuf::from("/opt/probe"));
        assert_eq!(
            config.helper_program().expect("path"),
            PathBuf::from("/opt/probe/probe-core-direct")
        );

        config.proxy = Some("127.0.0.1:1080".into());
        config.proxy_location_unknown = true;
        assert_eq!(
            config.helper_program().expect("path"),
            PathBuf::from("/opt/probe/probe-core-socks")
        );
    }

    #[test]
    fn test_parse_coordinates() {
        assert_eq!(parse_coordinates("-33.9, 18.4").expect("parse"), [-33.9, 18.4]);
        assert!(parse_coordinates("12.0").is_err());
        assert!(parse_coordinates("a,b").is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("probe.toml");
        std::fs::write(
            &path,
            "spacing = 5\ntimeout = 250\nn_probes = 3\nlocation = [1.5, 2.5]\n",
        )
        .expect("write");

        let config = ProbeConfig::from_file(&path).expect("load");
        assert_eq!(config.spacing, 5);
        assert_eq!(config.timeout, 250);
        assert_eq!(config.n_probes, 3);
        assert_eq!(config.parallel, 0);
        assert!(config.validate(HARD).is_ok());
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(toml::from_str::<ProbeConfig>("spacingg = 5").is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = valid();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        assert!(toml_str.contains("timeout = 1000"));
        assert!(toml_str.contains("location_unknown = true"));
        assert!(!toml_str.contains("proxy"));
    }
}
