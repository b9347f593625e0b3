//! Configuration: a TOML key-file naming the server lists per backend kind,
//! the backend bindings, and the core limits.
//!
//! The file is searched at `$SILO_CONFIG`, then `<user config dir>/silo.toml`,
//! then `/etc/silo.toml`; the first match wins. A configuration is immutable
//! once loaded and freely shared.

use crate::Error;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_PORT: u16 = 4711;
pub const DEFAULT_MAX_OPERATION_SIZE: u64 = 8 * 1024 * 1024;
pub const DEFAULT_STRIPE_SIZE: u64 = 512 * 1024;
pub const DEFAULT_MAX_CONNECTIONS: usize = 8;

/// The three kinds of backend servers a configuration names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Object,
    Kv,
    Db,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [BackendKind::Object, BackendKind::Kv, BackendKind::Db];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Object => "object",
            BackendKind::Kv => "kv",
            BackendKind::Db => "db",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Component {
    Client,
    Server,
}

/// Per-kind backend binding (`[object]`, `[kv]`, `[db]` sections).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackendConfig {
    pub backend: String,
    pub component: Component,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    hsm_policy: Option<HsmPolicy>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            component: Component::Server,
            path: String::new(),
            hsm_policy: None,
        }
    }
}

/// `[object.hsm-policy]`: parsed but inert until the HSM subsystem lands.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HsmPolicy {
    pub policy: String,
    // Both spellings are accepted; older configurations use underscores.
    #[serde(default, alias = "kv_backend")]
    pub kv_backend: String,
    #[serde(default, alias = "kv_path")]
    pub kv_path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct File {
    servers: Servers,
    #[serde(default)]
    object: BackendConfig,
    #[serde(default)]
    kv: BackendConfig,
    #[serde(default)]
    db: BackendConfig,
    #[serde(default)]
    core: Core,
}

#[derive(Debug, Deserialize)]
struct Servers {
    object: Vec<String>,
    kv: Vec<String>,
    db: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Core {
    max_operation_size: Option<u64>,
    stripe_size: Option<u64>,
    max_connections: Option<usize>,
    port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct Configuration {
    object_servers: Vec<String>,
    kv_servers: Vec<String>,
    db_servers: Vec<String>,

    object: BackendConfig,
    kv: BackendConfig,
    db: BackendConfig,

    max_operation_size: u64,
    stripe_size: u64,
    max_connections: usize,
    port: u16,
}

impl Configuration {
    /// Load from the standard search path.
    pub fn load() -> Result<Self, Error> {
        for path in Self::search_path() {
            if path.is_file() {
                return Self::from_path(&path);
            }
        }
        Err(Error::Config(
            "no configuration file found (set SILO_CONFIG or create silo.toml)".to_string(),
        ))
    }

    fn search_path() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Ok(path) = std::env::var("SILO_CONFIG") {
            paths.push(PathBuf::from(path));
        }
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("silo.toml"));
        }
        paths.push(PathBuf::from("/etc/silo.toml"));
        paths
    }

    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("{}: {err}", path.display())))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, Error> {
        let file: File = toml::from_str(raw).map_err(|err| Error::Config(err.to_string()))?;
        let core = file.core;

        let config = Self {
            object_servers: file.servers.object,
            kv_servers: file.servers.kv,
            db_servers: file.servers.db,
            object: file.object,
            kv: file.kv,
            db: file.db,
            max_operation_size: core
                .max_operation_size
                .unwrap_or(DEFAULT_MAX_OPERATION_SIZE),
            stripe_size: core.stripe_size.unwrap_or(DEFAULT_STRIPE_SIZE),
            max_connections: core.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            port: core.port.unwrap_or(DEFAULT_PORT),
        };
        config.validate()?;
        Ok(config)
    }

    /// Programmatic construction with default backends and limits.
    pub fn new(
        object_servers: Vec<String>,
        kv_servers: Vec<String>,
        db_servers: Vec<String>,
    ) -> Result<Self, Error> {
        let config = Self {
            object_servers,
            kv_servers,
            db_servers,
            object: BackendConfig::default(),
            kv: BackendConfig::default(),
            db: BackendConfig::default(),
            max_operation_size: DEFAULT_MAX_OPERATION_SIZE,
            stripe_size: DEFAULT_STRIPE_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            port: DEFAULT_PORT,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        for kind in BackendKind::ALL {
            let servers = self.servers(kind);
            if servers.is_empty() {
                return Err(Error::Config(format!(
                    "no {} servers configured",
                    kind.as_str()
                )));
            }
            if servers.iter().any(|s| s.trim().is_empty()) {
                return Err(Error::Config(format!(
                    "empty {} server entry",
                    kind.as_str()
                )));
            }
        }
        if self.max_operation_size == 0 {
            return Err(Error::Config("max-operation-size must be non-zero".into()));
        }
        if self.stripe_size == 0 {
            return Err(Error::Config("stripe-size must be non-zero".into()));
        }
        if self.max_connections == 0 {
            return Err(Error::Config("max-connections must be non-zero".into()));
        }
        Ok(())
    }

    pub fn set_max_operation_size(&mut self, size: u64) {
        self.max_operation_size = size;
    }

    pub fn set_stripe_size(&mut self, size: u64) {
        self.stripe_size = size;
    }

    pub fn set_max_connections(&mut self, count: usize) {
        self.max_connections = count;
    }

    pub fn servers(&self, kind: BackendKind) -> &[String] {
        match kind {
            BackendKind::Object => &self.object_servers,
            BackendKind::Kv => &self.kv_servers,
            BackendKind::Db => &self.db_servers,
        }
    }

    pub fn server_count(&self, kind: BackendKind) -> u32 {
        self.servers(kind).len() as u32
    }

    pub fn server(&self, kind: BackendKind, index: u32) -> Result<&str, Error> {
        self.servers(kind)
            .get(index as usize)
            .map(String::as_str)
            .ok_or_else(|| {
                Error::Config(format!(
                    "{} server index {index} out of range",
                    kind.as_str()
                ))
            })
    }

    /// `host[:port]` resolved against the configured default port.
    pub fn endpoint(&self, kind: BackendKind, index: u32) -> Result<String, Error> {
        let server = self.server(kind, index)?;
        if server.contains(':') {
            Ok(server.to_string())
        } else {
            Ok(format!("{server}:{}", self.port))
        }
    }

    pub fn backend(&self, kind: BackendKind) -> &BackendConfig {
        match kind {
            BackendKind::Object => &self.object,
            BackendKind::Kv => &self.kv,
            BackendKind::Db => &self.db,
        }
    }

    pub fn hsm_policy(&self) -> Option<&HsmPolicy> {
        self.object.hsm_policy.as_ref()
    }

    pub fn max_operation_size(&self) -> u64 {
        self.max_operation_size
    }

    pub fn stripe_size(&self) -> u64 {
        self.stripe_size
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}
