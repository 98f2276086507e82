//! Listener and engine configuration.

use std::path::PathBuf;

use serde::Deserialize;

/// Fallback when a listener's port is missing or unparseable.
pub const DEFAULT_PORT: u16 = 8080;

/// Default ceiling on decoded request bodies (100 MiB).
pub const DEFAULT_BODY_LIMIT: usize = 100 * 1024 * 1024;

/// One endpoint the server binds.
///
/// `prefix` is either empty or starts with `/` and does not end with `/`;
/// [`ListenerConfig::validate`] enforces this at startup.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    /// Port as a string: `"0"` asks the OS for a free port, any other
    /// numeric string is parsed, anything else falls back to 8080.
    pub port: Option<String>,
    /// Bind address; defaults to `0.0.0.0`.
    pub host: Option<String>,
    /// URL-path mount point shared by all routes on this listener.
    pub prefix: Option<String>,
    /// Serve TLS on this listener.
    #[serde(default)]
    pub secure: bool,
    /// PEM private key, required when `secure` is set.
    pub key: Option<PathBuf>,
    /// PEM certificate chain, required when `secure` is set.
    pub cert: Option<PathBuf>,
    /// Extra cleartext port answering every request with a redirect to this
    /// listener's HTTPS origin.
    pub redirect: Option<u16>,
    /// Per-listener body ceiling override, in bytes.
    pub body_limit: Option<usize>,
}

impl ListenerConfig {
    /// Applies the port rules: `"0"` means OS-chosen, numeric strings parse,
    /// missing or invalid values fall back to [`DEFAULT_PORT`].
    pub fn parse_port(&self) -> u16 {
        match self.port.as_deref() {
            Some(raw) => raw.trim().parse::<u16>().unwrap_or(DEFAULT_PORT),
            None => DEFAULT_PORT,
        }
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or("0.0.0.0")
    }

    /// The validated path prefix, empty when unset.
    pub fn prefix(&self) -> &str {
        self.prefix.as_deref().unwrap_or("")
    }

    pub fn body_limit(&self) -> usize {
        self.body_limit.unwrap_or(DEFAULT_BODY_LIMIT)
    }

    /// Checks the constraints a listener must satisfy before binding.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(prefix) = self.prefix.as_deref() {
            if !prefix.is_empty() {
                if !prefix.starts_with('/') {
                    return Err(format!("path prefix {:?} must start with '/'", prefix));
                }
                if prefix.ends_with('/') {
                    return Err(format!("path prefix {:?} must not end with '/'", prefix));
                }
            }
        }
        if self.secure && (self.key.is_none() || self.cert.is_none()) {
            return Err("secure listener requires both key and cert".to_string());
        }
        if !self.secure && self.redirect.is_some() {
            return Err("redirect port only makes sense on a secure listener".to_string());
        }
        Ok(())
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    /// The listener set; one socket is bound per entry.
    pub listeners: Vec<ListenerConfig>,
    /// Enables structured trace logs for dispatch phases.
    #[serde(default)]
    pub debug: bool,
}

impl EngineConfig {
    /// Assembles a single-listener config from the environment.
    ///
    /// The engine itself reads only `PORT` plus the debug flag; the
    /// `MULTIWIKI_*` variables are the binary's own knobs.
    pub fn from_env() -> Self {
        let port = std::env::var("PORT").ok();
        let prefix = std::env::var("MULTIWIKI_PREFIX").ok().filter(|p| !p.is_empty());
        let key = std::env::var("MULTIWIKI_TLS_KEY").ok().map(PathBuf::from);
        let cert = std::env::var("MULTIWIKI_TLS_CERT").ok().map(PathBuf::from);
        let secure = key.is_some() && cert.is_some();
        let debug = std::env::var("MULTIWIKI_DEBUG").is_ok();
        Self {
            listeners: vec![ListenerConfig {
                port,
                prefix,
                secure,
                key,
                cert,
                ..Default::default()
            }],
            debug,
        }
    }
}
