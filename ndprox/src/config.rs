//! Daemon configuration
//!
//! A single JSON file describes global timing knobs plus one entry per
//! upstream interface. The raw serde model is validated into typed form
//! (parsed prefixes, checked rule modes) before startup sees it.

use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use ipnet::Ipv6Net;
use serde::Deserialize;
use thiserror::Error;

/// Configuration errors. All fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: String, source: io::Error },

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid prefix {prefix:?}: {source}")]
    Prefix {
        prefix: String,
        source: ipnet::AddrParseError,
    },

    #[error("unknown rule mode {0:?}")]
    UnknownMode(String),

    #[error("rule {prefix} has mode \"iface\" but no interface name")]
    MissingIface { prefix: String },

    #[error("renew ({renew} ms) must be smaller than valid_ttl ({valid_ttl} ms)")]
    RenewTooLarge { renew: u64, valid_ttl: u64 },
}

/// Session timing knobs shared by all proxies.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    /// How long INVALID suppresses repeat probes.
    pub invalid_ttl: Duration,
    /// How long VALID persists.
    pub valid_ttl: Duration,
    /// How early before `valid_ttl` renewal begins.
    pub renew: Duration,
    /// Maximum downstream NS transmissions per validation round.
    pub retrans_limit: u32,
    /// Interval between retransmissions.
    pub retrans_time: Duration,
    /// Whether VALID sessions are re-probed instead of expiring.
    pub keepalive: bool,
}

/// Validated rule mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleModeSpec {
    Static,
    Auto { autovia: bool },
    Iface(String),
}

/// Validated rule.
#[derive(Debug, Clone)]
pub struct RuleSpec {
    pub prefix: Ipv6Net,
    pub mode: RuleModeSpec,
}

/// Validated per-upstream proxy entry.
#[derive(Debug, Clone)]
pub struct ProxySpec {
    pub iface: String,
    pub router: bool,
    pub promiscuous: bool,
    pub rules: Vec<RuleSpec>,
}

/// Validated daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub timing: Timing,
    pub proxies: Vec<ProxySpec>,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Parse and validate configuration from a JSON string.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let raw: FileConfig = serde_json::from_str(text)?;
        raw.validate()
    }
}

fn default_invalid_ttl() -> u64 {
    10_000
}

fn default_valid_ttl() -> u64 {
    30_000
}

fn default_renew() -> u64 {
    5_000
}

fn default_retrans_limit() -> u32 {
    3
}

fn default_retrans_time() -> u64 {
    1_000
}

fn default_mode() -> String {
    "static".to_string()
}

fn default_true() -> bool {
    true
}

/// Raw serde model of the config file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    /// Milliseconds.
    #[serde(default = "default_invalid_ttl")]
    invalid_ttl: u64,
    /// Milliseconds.
    #[serde(default = "default_valid_ttl")]
    valid_ttl: u64,
    /// Milliseconds.
    #[serde(default = "default_renew")]
    renew: u64,
    #[serde(default = "default_retrans_limit")]
    retrans_limit: u32,
    /// Milliseconds.
    #[serde(default = "default_retrans_time")]
    retrans_time: u64,
    #[serde(default)]
    keepalive: bool,
    #[serde(default)]
    proxies: Vec<FileProxy>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileProxy {
    iface: String,
    #[serde(default = "default_true")]
    router: bool,
    #[serde(default)]
    promiscuous: bool,
    #[serde(default)]
    rules: Vec<FileRule>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRule {
    prefix: String,
    /// One of "static", "auto", "iface".
    #[serde(default = "default_mode")]
    mode: String,
    /// Downstream interface for mode "iface".
    #[serde(default)]
    iface: Option<String>,
    /// For mode "auto": follow the gateway of indirect routes.
    #[serde(default)]
    autovia: bool,
}

impl FileConfig {
    fn validate(self) -> Result<Config, ConfigError> {
        if self.renew >= self.valid_ttl {
            return Err(ConfigError::RenewTooLarge {
                renew: self.renew,
                valid_ttl: self.valid_ttl,
            });
        }

        let timing = Timing {
            invalid_ttl: Duration::from_millis(self.invalid_ttl),
            valid_ttl: Duration::from_millis(self.valid_ttl),
            renew: Duration::from_millis(self.renew),
            retrans_limit: self.retrans_limit,
            retrans_time: Duration::from_millis(self.retrans_time),
            keepalive: self.keepalive,
        };

        let mut proxies = Vec::with_capacity(self.proxies.len());
        for proxy in self.proxies {
            let mut rules = Vec::with_capacity(proxy.rules.len());
            for rule in proxy.rules {
                rules.push(rule.validate()?);
            }
            proxies.push(ProxySpec {
                iface: proxy.iface,
                router: proxy.router,
                promiscuous: proxy.promiscuous,
                rules,
            });
        }

        Ok(Config { timing, proxies })
    }
}

impl FileRule {
    fn validate(self) -> Result<RuleSpec, ConfigError> {
        let FileRule {
            prefix,
            mode,
            iface,
            autovia,
        } = self;

        let net: Ipv6Net = prefix.parse().map_err(|source| ConfigError::Prefix {
            prefix: prefix.clone(),
            source,
        })?;

        let mode = match mode.as_str() {
            "static" => RuleModeSpec::Static,
            "auto" => RuleModeSpec::Auto { autovia },
            "iface" => {
                RuleModeSpec::Iface(iface.ok_or(ConfigError::MissingIface { prefix })?)
            }
            other => return Err(ConfigError::UnknownMode(other.to_string())),
        };

        Ok(RuleSpec { prefix: net, mode })
    }
}
