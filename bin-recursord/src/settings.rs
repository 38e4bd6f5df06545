use config::{ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;

use dns_recursor::config::{root_hints, CacheConfig, Config};

/// Layered settings: built-in defaults, then an optional properties
/// (INI) file, then `RECURSORD_`-prefixed environment variables, with
/// `__` separating the section from the key - so `[resolver]
/// timeout_ms` in the file and `RECURSORD_RESOLVER__TIMEOUT_MS` in
/// the environment name the same setting.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub resolver: ResolverSettings,
    #[serde(default)]
    pub cache: CacheSettings,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct ResolverSettings {
    /// Comma-separated nameserver addresses to start every walk from.
    /// Unset means the thirteen root servers.
    pub root_servers: Option<String>,
    pub upstream_port: u16,
    pub timeout_ms: u64,
    pub max_depth: usize,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            root_servers: None,
            upstream_port: 53,
            timeout_ms: 5000,
            max_depth: 16,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub max_entries: usize,
    pub max_memory_bytes: usize,
    pub min_ttl_seconds: u32,
    /// How often to log cache statistics.  Zero disables the task.
    pub stats_interval_seconds: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_memory_bytes: 10 * 1024 * 1024,
            min_ttl_seconds: 10,
            stats_interval_seconds: 300,
        }
    }
}

impl Settings {
    /// # Errors
    ///
    /// If the file or the environment cannot be read or deserialised.
    pub fn new(filename: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(filename) = filename {
            builder = builder.add_source(File::new(filename, FileFormat::Ini));
        }
        builder
            .add_source(Environment::with_prefix("RECURSORD").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Freeze into the immutable configuration the resolver and cache
    /// are constructed with.
    ///
    /// # Errors
    ///
    /// If a root server address does not parse, or the list is empty.
    pub fn to_config(&self) -> Result<Config, String> {
        let root_servers = match &self.resolver.root_servers {
            None => root_hints(),
            Some(list) => {
                let mut addresses = Vec::new();
                for part in list.split(',') {
                    let part = part.trim();
                    if part.is_empty() {
                        continue;
                    }
                    match part.parse::<IpAddr>() {
                        Ok(address) => addresses.push(address),
                        Err(_) => return Err(format!("invalid root server address '{part}'")),
                    }
                }
                if addresses.is_empty() {
                    return Err("resolver.root_servers has no addresses".to_string());
                }
                addresses
            }
        };

        Ok(Config {
            root_servers,
            upstream_port: self.resolver.upstream_port,
            timeout: Duration::from_millis(self.resolver.timeout_ms),
            max_depth: self.resolver.max_depth,
            cache: CacheConfig {
                max_entries: self.cache.max_entries,
                max_memory_bytes: self.cache.max_memory_bytes,
                min_ttl: self.cache.min_ttl_seconds,
            },
        })
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        if self.cache.stats_interval_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.cache.stats_interval_seconds))
        }
    }
}
