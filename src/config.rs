//! Application configuration.
//!
//! Loaded from TOML. String fields may reference environment variables as
//! `$UPPER_CASE` tokens, which [`AppConfig::parse_env`] substitutes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::error::Error;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    pub version: String,
    /// e.g. `0.0.0.0:8080`
    pub host_addr: String,
    /// e.g. `0.0.0.0:8443`; empty disables the TLS listener.
    pub host_addr_tls: String,
    pub tls_certificate_path: String,
    pub tls_key_path: String,
    /// Redirects every plain request to its TLS equivalent.
    pub tls_redirect: bool,
    /// `;`-joined route files, loaded in order.
    pub routes_config_path: String,
    pub default_language: String,
    pub data: HashMap<String, String>,
    pub dynamic_access_log: bool,
    /// Lets the [`compress`](crate::filter::compress) filter gzip dynamic
    /// responses for clients that accept it.
    pub gzip_dynamic: bool,
    /// 0 disables the slow-request reaper.
    pub slow_request_timeout_secs: u64,
    /// Period of the idle-session sweep; 15 minutes when unset, 0 disables it.
    pub session_cleanup_interval_secs: Option<u64>,
    /// Sessions not updated for this long are dropped; 15 days when unset.
    pub session_max_age_secs: Option<u64>,
}

const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(15 * 60);
const SESSION_MAX_AGE: Duration = Duration::from_secs(15 * 24 * 60 * 60);

impl AppConfig {
    pub fn from_toml(content: &str) -> Result<Self, Error> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }

    /// Replaces `$VAR` tokens in every string field with the value of the
    /// environment variable `VAR` (empty when unset).
    pub fn parse_env(&mut self) {
        let re = &*ENV_TOKEN;
        let sub = |s: &mut String| {
            let replaced = re.replace_all(s, |caps: &regex::Captures<'_>| {
                std::env::var(&caps[0][1..]).unwrap_or_default()
            });
            *s = replaced.into_owned();
        };

        sub(&mut self.name);
        sub(&mut self.version);
        sub(&mut self.host_addr);
        sub(&mut self.host_addr_tls);
        sub(&mut self.tls_certificate_path);
        sub(&mut self.tls_key_path);
        sub(&mut self.routes_config_path);
        sub(&mut self.default_language);
        self.data.values_mut().for_each(sub);
    }

    /// Port of the TLS listener, used when building HTTPS redirects.
    pub fn tls_port(&self) -> Option<u16> {
        self.host_addr_tls.rsplit_once(':')?.1.parse().ok()
    }

    pub fn slow_request_timeout(&self) -> Option<Duration> {
        (self.slow_request_timeout_secs > 0).then(|| Duration::from_secs(self.slow_request_timeout_secs))
    }

    /// How often to sweep idle sessions and how old they must be, or `None`
    /// when the sweep is disabled.
    pub fn session_maintenance(&self) -> Option<(Duration, Duration)> {
        let every = match self.session_cleanup_interval_secs {
            Some(0) => return None,
            Some(secs) => Duration::from_secs(secs),
            None => SESSION_CLEANUP_INTERVAL,
        };
        let max_age = self.session_max_age_secs.map_or(SESSION_MAX_AGE, Duration::from_secs);
        Some((every, max_age))
    }
}

static ENV_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$_*[A-Z][A-Z0-9_]+").expect("env token pattern is valid"));
