//! Process-wide datapath configuration, fixed once the classifier is built

use crate::constants::V4_CACHE_KEY_LEN;
use crate::errors::Error;
use log::debug;

pub const ENV_NO_ENCAPSULATION: &str = "HSIPCACHE_NO_ENCAPSULATION";
pub const ENV_ENDPOINT_ROUTES: &str = "HSIPCACHE_ENDPOINT_ROUTES";
pub const ENV_V4_CACHE_KEY_LEN: &str = "HSIPCACHE_V4_CACHE_KEY_LEN";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatapathConfig {
    /// Transparent mode: no egress packet is ever tunneled.
    pub no_encapsulation: bool,
    /// Per-endpoint routes are installed, so local destinations are
    /// redirected before the encapsulation decision is reached.
    pub endpoint_routing: bool,
    /// Address bits the world-CIDR cache resolves.
    pub cache_key_depth: u8,
}

impl Default for DatapathConfig {
    fn default() -> Self {
        Self {
            no_encapsulation: false,
            endpoint_routing: false,
            cache_key_depth: V4_CACHE_KEY_LEN,
        }
    }
}

impl DatapathConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if !(1..=32).contains(&self.cache_key_depth) {
            return Err(Error::InvalidConfig(format!(
                "cache_key_depth must be within 1..=32, got {}",
                self.cache_key_depth
            )));
        }
        Ok(())
    }

    /// Defaults overridden by `HSIPCACHE_*` environment variables.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Same as [`DatapathConfig::from_env`] over an arbitrary source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(v) = lookup(ENV_NO_ENCAPSULATION) {
            cfg.no_encapsulation = parse_flag(ENV_NO_ENCAPSULATION, &v)?;
        }
        if let Some(v) = lookup(ENV_ENDPOINT_ROUTES) {
            cfg.endpoint_routing = parse_flag(ENV_ENDPOINT_ROUTES, &v)?;
        }
        if let Some(v) = lookup(ENV_V4_CACHE_KEY_LEN) {
            cfg.cache_key_depth = v.trim().parse().map_err(|_| {
                Error::InvalidConfig(format!("{ENV_V4_CACHE_KEY_LEN}={v:?} is not a bit count"))
            })?;
        }
        cfg.validate()?;
        debug!("datapath config: {cfg:?}");
        Ok(cfg)
    }
}

fn parse_flag(name: &str, raw: &str) -> Result<bool, Error> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(Error::InvalidConfig(format!("{name}={raw:?} is not a boolean"))),
    }
}
