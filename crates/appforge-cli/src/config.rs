//! Configuration file management for appforge.
//!
//! Provides a TOML-based config file at `~/.config/appforge/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use appforge_core::PhaseLimits;
use appforge_core::phases::FileLayout;
use appforge_db::config::DbConfig;

pub const ENV_DATABASE_URL: &str = "APPFORGE_DATABASE_URL";
pub const ENV_USER_PATH: &str = "APPFORGE_USER_PATH";
pub const ENV_TEMPLATE_ROOT: &str = "APPFORGE_TEMPLATE_ROOT";
pub const ENV_RESOURCE_ROOT: &str = "APPFORGE_RESOURCE_ROOT";

pub const DEFAULT_USER_PATH: &str = "apps";
pub const DEFAULT_TEMPLATE_ROOT: &str = "templates";
pub const DEFAULT_RESOURCE_ROOT: &str = "resources";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub limits: LimitsSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

/// Filesystem roots. Unset entries fall through to env vars and defaults.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PathsSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_root: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_root: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    pub statement_timeout_secs: u64,
    pub fs_op_timeout_secs: u64,
    pub compensation_timeout_secs: u64,
    pub acquire_timeout_secs: u64,
}

impl Default for LimitsSection {
    fn default() -> Self {
        let limits = PhaseLimits::default();
        Self {
            statement_timeout_secs: limits.statement_timeout.as_secs(),
            fs_op_timeout_secs: limits.fs_op_timeout.as_secs(),
            compensation_timeout_secs: limits.compensation_timeout.as_secs(),
            acquire_timeout_secs: DbConfig::DEFAULT_ACQUIRE_TIMEOUT.as_secs(),
        }
    }
}

impl LimitsSection {
    fn phase_limits(&self) -> PhaseLimits {
        PhaseLimits {
            statement_timeout: Duration::from_secs(self.statement_timeout_secs),
            fs_op_timeout: Duration::from_secs(self.fs_op_timeout_secs),
            compensation_timeout: Duration::from_secs(self.compensation_timeout_secs),
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the appforge config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/appforge` or
/// `~/.config/appforge`, also on macOS.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("appforge");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("appforge")
}

/// Return the path to the appforge config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. `Ok(None)` when there is no file; a file
/// that exists but does not parse is an error.
pub fn load_config() -> Result<Option<ConfigFile>> {
    let path = config_path();
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(Some(config))
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix: the database URL may carry a
/// password.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Values given on the command line; each one wins over everything else.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub database_url: Option<String>,
    pub user_path: Option<PathBuf>,
    pub template_root: Option<PathBuf>,
    pub resource_root: Option<PathBuf>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct AppforgeConfig {
    pub db_config: DbConfig,
    pub layout: FileLayout,
    pub limits: PhaseLimits,
}

impl AppforgeConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - DB URL: `--database-url` > `APPFORGE_DATABASE_URL` > `[database].url` > `DbConfig::DEFAULT_URL`
    /// - Paths: `--user-path` etc. > `APPFORGE_USER_PATH` etc. > `[paths]` > `./apps`, `./templates`, `./resources`
    /// - Limits: `[limits]` > built-in defaults
    pub fn resolve(cli: &CliOverrides) -> Result<Self> {
        let file_config = load_config()?;

        let db_url = if let Some(url) = &cli.database_url {
            url.clone()
        } else if let Ok(url) = std::env::var(ENV_DATABASE_URL) {
            url
        } else if let Some(cfg) = &file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };

        let paths = file_config.as_ref().map(|c| &c.paths);
        let user_path = resolve_path(
            cli.user_path.as_ref(),
            ENV_USER_PATH,
            paths.and_then(|p| p.user_path.as_ref()),
            DEFAULT_USER_PATH,
        );
        let template_root = resolve_path(
            cli.template_root.as_ref(),
            ENV_TEMPLATE_ROOT,
            paths.and_then(|p| p.template_root.as_ref()),
            DEFAULT_TEMPLATE_ROOT,
        );
        let resource_root = resolve_path(
            cli.resource_root.as_ref(),
            ENV_RESOURCE_ROOT,
            paths.and_then(|p| p.resource_root.as_ref()),
            DEFAULT_RESOURCE_ROOT,
        );

        let limits_section = file_config.map(|c| c.limits).unwrap_or_default();
        let mut db_config = DbConfig::new(db_url);
        db_config.acquire_timeout = Duration::from_secs(limits_section.acquire_timeout_secs);

        Ok(Self {
            db_config,
            layout: FileLayout::new(user_path, template_root, resource_root),
            limits: limits_section.phase_limits(),
        })
    }
}

fn resolve_path(
    cli: Option<&PathBuf>,
    env_var: &str,
    file: Option<&PathBuf>,
    default: &str,
) -> PathBuf {
    if let Some(path) = cli {
        return path.clone();
    }
    if let Ok(path) = std::env::var(env_var) {
        return PathBuf::from(path);
    }
    file.cloned().unwrap_or_else(|| PathBuf::from(default))
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        crate::test_util::lock_env()
    }

    /// Point `XDG_CONFIG_HOME` at a temp dir and clear every appforge env
    /// var for the duration of the returned guard.
    struct IsolatedEnv {
        _tmp: tempfile::TempDir,
        orig_xdg: Option<String>,
    }

    impl IsolatedEnv {
        fn new() -> Self {
            let tmp = tempfile::TempDir::new().unwrap();
            let orig_xdg = std::env::var("XDG_CONFIG_HOME").ok();
            unsafe { std::env::set_var("XDG_CONFIG_HOME", tmp.path()) };
            for var in [ENV_DATABASE_URL, ENV_USER_PATH, ENV_TEMPLATE_ROOT, ENV_RESOURCE_ROOT] {
                unsafe { std::env::remove_var(var) };
            }
            Self {
                _tmp: tmp,
                orig_xdg,
            }
        }
    }

    impl Drop for IsolatedEnv {
        fn drop(&mut self) {
            match self.orig_xdg.take() {
                Some(x) => unsafe { std::env::set_var("XDG_CONFIG_HOME", x) },
                None => unsafe { std::env::remove_var("XDG_CONFIG_HOME") },
            }
            for var in [ENV_DATABASE_URL, ENV_USER_PATH, ENV_TEMPLATE_ROOT, ENV_RESOURCE_ROOT] {
                unsafe { std::env::remove_var(var) };
            }
        }
    }

    fn sample_file() -> ConfigFile {
        ConfigFile {
            database: DatabaseSection {
                url: "postgresql://file:5432/filedb".to_string(),
            },
            paths: PathsSection {
                user_path: Some(PathBuf::from("/srv/apps")),
                template_root: None,
                resource_root: Some(PathBuf::from("/srv/resources")),
            },
            limits: LimitsSection {
                statement_timeout_secs: 5,
                ..LimitsSection::default()
            },
        }
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let _lock = lock_env();
        let _env = IsolatedEnv::new();

        save_config(&sample_file()).unwrap();
        let loaded = load_config().unwrap().expect("config file should exist");

        assert_eq!(loaded.database.url, "postgresql://file:5432/filedb");
        assert_eq!(loaded.paths.user_path, Some(PathBuf::from("/srv/apps")));
        assert_eq!(loaded.paths.template_root, None);
        assert_eq!(loaded.limits.statement_timeout_secs, 5);
        assert_eq!(loaded.limits.fs_op_timeout_secs, 30);
    }

    #[cfg(unix)]
    #[test]
    fn save_config_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let _lock = lock_env();
        let _env = IsolatedEnv::new();

        save_config(&sample_file()).unwrap();
        let meta = std::fs::metadata(config_path()).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn minimal_file_fills_in_defaults() {
        let parsed: ConfigFile =
            toml::from_str("[database]\nurl = \"postgresql://h/db\"\n").unwrap();
        assert!(parsed.paths.user_path.is_none());
        assert_eq!(parsed.limits.compensation_timeout_secs, 60);
    }

    #[test]
    fn resolve_with_cli_flag_overrides_all() {
        let _lock = lock_env();
        let _env = IsolatedEnv::new();
        save_config(&sample_file()).unwrap();

        unsafe { std::env::set_var(ENV_DATABASE_URL, "postgresql://env:5432/envdb") };
        unsafe { std::env::set_var(ENV_USER_PATH, "/env/apps") };

        let config = AppforgeConfig::resolve(&CliOverrides {
            database_url: Some("postgresql://cli:5432/clidb".into()),
            user_path: Some(PathBuf::from("/cli/apps")),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://cli:5432/clidb");
        assert_eq!(config.layout.user_path, PathBuf::from("/cli/apps"));
    }

    #[test]
    fn resolve_with_env_var_overrides_config_file() {
        let _lock = lock_env();
        let _env = IsolatedEnv::new();
        save_config(&sample_file()).unwrap();

        unsafe { std::env::set_var(ENV_DATABASE_URL, "postgresql://env:5432/envdb") };
        unsafe { std::env::set_var(ENV_RESOURCE_ROOT, "/env/resources") };

        let config = AppforgeConfig::resolve(&CliOverrides::default()).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://env:5432/envdb");
        assert_eq!(config.layout.resource_root, PathBuf::from("/env/resources"));
        // From the file.
        assert_eq!(config.layout.user_path, PathBuf::from("/srv/apps"));
        assert_eq!(config.limits.statement_timeout, Duration::from_secs(5));
    }

    #[test]
    fn resolve_defaults_when_nothing_set() {
        let _lock = lock_env();
        let _env = IsolatedEnv::new();

        let config = AppforgeConfig::resolve(&CliOverrides::default()).unwrap();
        assert_eq!(config.db_config.database_url, DbConfig::DEFAULT_URL);
        assert_eq!(config.layout.user_path, PathBuf::from(DEFAULT_USER_PATH));
        assert_eq!(config.layout.template_root, PathBuf::from(DEFAULT_TEMPLATE_ROOT));
        assert_eq!(config.limits, PhaseLimits::default());
        assert_eq!(
            config.db_config.acquire_timeout,
            DbConfig::DEFAULT_ACQUIRE_TIMEOUT
        );
    }

    #[test]
    fn resolve_rejects_a_corrupt_config_file() {
        let _lock = lock_env();
        let _env = IsolatedEnv::new();
        std::fs::create_dir_all(config_dir()).unwrap();
        std::fs::write(config_path(), "database = 3").unwrap();

        let err = AppforgeConfig::resolve(&CliOverrides::default()).unwrap_err();
        assert!(
            err.to_string().contains("failed to parse config file"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("appforge/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
