//! Proxy configuration (C10): the JSON document describing the listen
//! address, idle-session timeout, and handler chain.
//!
//! Grounded on this crate's previous `Config`/`from_file`/`parse` split
//! (kept), reworked from the teacher's YAML schema (listen addresses,
//! timeouts, connection pools, per-protocol routing knobs) to the flat
//! JSON document the core's handler chain actually consumes. `serde_json`
//! replaces `serde_yaml_ng`: the wire format is JSON, not YAML, and
//! `serde_json` was already a workspace dependency (previously used only
//! for JSON-RPC body sniffing).

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;

pub const DEFAULT_LISTEN: &str = ":5520";
pub const DEFAULT_SESSION_TIMEOUT: u64 = 600;

#[derive(Debug)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

/// Re-parses `contents` through a visitor that walks every JSON object in
/// the document checking each key is seen once, independent of the
/// `Config`/`HandlerConfig` deserialization pass below (which decodes
/// handler-specific payloads, e.g. sni-router's `routes` map, through
/// `serde_json::Value` — whose own map insert silently keeps the
/// last-seen value for a repeated key rather than erroring, so a duplicate
/// SNI route would otherwise disappear without a trace). Run against the
/// raw source text, since by the time any value reaches `Value` the
/// duplicate is already gone.
fn reject_duplicate_keys(contents: &str) -> Result<(), ConfigError> {
    let mut de = serde_json::Deserializer::from_str(contents);
    de.deserialize_any(DenyDuplicateKeys)
        .map_err(|e| ConfigError(format!("duplicate key in config: {e}")))
}

struct DenyDuplicateKeys;

impl<'de> Visitor<'de> for DenyDuplicateKeys {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "any valid JSON value")
    }

    fn visit_map<A>(self, mut map: A) -> Result<(), A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut seen = HashSet::new();
        while let Some(key) = map.next_key::<String>()? {
            if !seen.insert(key.clone()) {
                return Err(de::Error::custom(format!("duplicate key \"{key}\"")));
            }
            map.next_value_seed(DenyDuplicateKeysSeed)?;
        }
        Ok(())
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<(), A::Error>
    where
        A: SeqAccess<'de>,
    {
        while seq.next_element_seed(DenyDuplicateKeysSeed)?.is_some() {}
        Ok(())
    }

    fn visit_bool<E>(self, _v: bool) -> Result<(), E> {
        Ok(())
    }
    fn visit_i64<E>(self, _v: i64) -> Result<(), E> {
        Ok(())
    }
    fn visit_u64<E>(self, _v: u64) -> Result<(), E> {
        Ok(())
    }
    fn visit_f64<E>(self, _v: f64) -> Result<(), E> {
        Ok(())
    }
    fn visit_str<E>(self, _v: &str) -> Result<(), E> {
        Ok(())
    }
    fn visit_string<E>(self, _v: String) -> Result<(), E> {
        Ok(())
    }
    fn visit_unit<E>(self) -> Result<(), E> {
        Ok(())
    }
    fn visit_none<E>(self) -> Result<(), E> {
        Ok(())
    }
    fn visit_some<D>(self, deserializer: D) -> Result<(), D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(self)
    }
}

struct DenyDuplicateKeysSeed;

impl<'de> de::DeserializeSeed<'de> for DenyDuplicateKeysSeed {
    type Value = ();

    fn deserialize<D>(self, deserializer: D) -> Result<(), D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(DenyDuplicateKeys)
    }
}

/// One entry in the `handlers` array: a handler-type string plus its
/// free-form, handler-specific config payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Proxy configuration loaded from JSON.
///
/// `listen` and `session_timeout` fall back to environment variables and
/// built-in defaults respectively when absent — resolved once, at load
/// time, via [`Config::resolved_listen`]/[`Config::resolved_session_timeout`],
/// so downstream code never has to repeat the fallback chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub listen: Option<String>,
    #[serde(default)]
    pub session_timeout: Option<u64>,
    pub handlers: Vec<HandlerConfig>,
}

impl Config {
    /// Loads configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ConfigError(format!("reading {}: {e}", path.display())))?;
        Self::parse(&contents)
    }

    /// Parses configuration from a JSON string.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        reject_duplicate_keys(contents)?;
        let config: Config =
            serde_json::from_str(contents).map_err(|e| ConfigError(format!("parsing config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Startup/reload validation: a non-empty handler list. Whether every
    /// named handler type is actually known is checked separately by
    /// `sniproxy_core::handler::build` when the chain is constructed — this
    /// only rejects the trivially-empty case early.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.handlers.is_empty() {
            return Err(ConfigError("handlers must be non-empty".to_string()));
        }
        Ok(())
    }

    /// Resolves the effective listen address: configured value, else
    /// `HYPROXY_LISTEN`, else [`DEFAULT_LISTEN`].
    pub fn resolved_listen(&self) -> String {
        match &self.listen {
            Some(l) if !l.is_empty() => l.clone(),
            _ => match std::env::var("HYPROXY_LISTEN") {
                Ok(l) if !l.is_empty() => l,
                _ => DEFAULT_LISTEN.to_string(),
            },
        }
    }

    /// Resolves the effective idle-session timeout in seconds.
    pub fn resolved_session_timeout(&self) -> u64 {
        self.session_timeout.unwrap_or(DEFAULT_SESSION_TIMEOUT)
    }

    /// Reload support (spec.md §6): the listen address cannot change
    /// without a restart. Returns an error naming the rejected change;
    /// the caller is expected to keep running on the old config.
    pub fn validate_reload(&self, previous: &Config) -> Result<(), ConfigError> {
        if self.resolved_listen() != previous.resolved_listen() {
            return Err(ConfigError(
                "listen address cannot change on reload".to_string(),
            ));
        }
        self.validate()
    }
}
