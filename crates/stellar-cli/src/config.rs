//! Configuration file management for stellar.
//!
//! Provides a TOML-based config file at `~/.config/stellar/config.toml` and
//! a resolution chain: CLI flag > env var > config file > default.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use stellar_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub controller: ControllerSection,
    #[serde(default)]
    pub dns: DnsSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ControllerSection {
    pub bind: String,
    pub port: u16,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_owned(),
            port: 8440,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DnsSection {
    /// Upstream resolvers for locally-run enumeration, as `ip:port`.
    pub resolvers: Vec<String>,
}

impl Default for DnsSection {
    fn default() -> Self {
        Self {
            resolvers: vec!["8.8.8.8:53".to_owned(), "1.1.1.1:53".to_owned()],
        }
    }
}

/// Path of the stellar config file under the XDG layout:
/// `$XDG_CONFIG_HOME/stellar/config.toml` or `~/.config/stellar/config.toml`.
pub fn config_path() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("stellar").join("config.toml")
}

impl ConfigFile {
    /// Read the config file. Errors when it does not exist or fails to
    /// parse.
    pub fn load() -> Result<Self> {
        let path = config_path();
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file at {}", path.display()))
    }

    /// Write the config file atomically: the TOML is staged next to the
    /// final path, restricted to 0600 on Unix (it may carry database
    /// credentials), and renamed into place so a crash never leaves a
    /// half-written config.
    pub fn save(&self) -> Result<()> {
        let path = config_path();
        let dir = path.parent().expect("config path always has a parent");
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;

        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        let staged = path.with_extension("toml.tmp");
        std::fs::write(&staged, &contents)
            .with_context(|| format!("failed to stage config at {}", staged.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("failed to set permissions on {}", staged.display()))?;
        }

        std::fs::rename(&staged, &path)
            .with_context(|| format!("failed to move config into place at {}", path.display()))
    }
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct StellarConfig {
    pub db_config: DbConfig,
    pub controller: ControllerSection,
    pub resolvers: Vec<SocketAddr>,
}

impl StellarConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = ConfigFile::load().ok();

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("STELLAR_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            stellar_db::config::DEFAULT_URL.to_string()
        };
        let db_config = DbConfig::parse(db_url).context("invalid database URL")?;

        let controller = file_config
            .as_ref()
            .map(|c| ControllerSection {
                bind: c.controller.bind.clone(),
                port: c.controller.port,
            })
            .unwrap_or_default();

        let resolver_strs = file_config
            .map(|c| c.dns.resolvers)
            .unwrap_or_else(|| DnsSection::default().resolvers);
        let mut resolvers = Vec::with_capacity(resolver_strs.len());
        for entry in &resolver_strs {
            let addr: SocketAddr = entry
                .parse()
                .with_context(|| format!("invalid resolver address {entry:?} in config"))?;
            resolvers.push(addr);
        }

        Ok(Self {
            db_config,
            controller,
            resolvers,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_roundtrip() {
        let original = ConfigFile {
            database: DatabaseSection {
                url: "postgresql://testhost:5432/testdb".to_string(),
            },
            controller: ControllerSection {
                bind: "127.0.0.1".into(),
                port: 9000,
            },
            dns: DnsSection::default(),
        };

        let contents = toml::to_string_pretty(&original).unwrap();
        let loaded: ConfigFile = toml::from_str(&contents).unwrap();

        assert_eq!(loaded.database.url, original.database.url);
        assert_eq!(loaded.controller.port, 9000);
        assert_eq!(loaded.dns.resolvers.len(), 2);
    }

    #[test]
    fn missing_sections_use_defaults() {
        let loaded: ConfigFile =
            toml::from_str("[database]\nurl = \"postgresql://h:5432/d\"\n").unwrap();
        assert_eq!(loaded.controller.port, 8440);
        assert!(!loaded.dns.resolvers.is_empty());
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("stellar/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }

    #[test]
    fn resolve_rejects_bad_cli_url() {
        let result = StellarConfig::resolve(Some("mysql://somewhere:3306/stellar"));
        assert!(result.is_err());
    }
}
