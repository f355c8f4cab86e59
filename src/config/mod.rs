mod file_config;

pub use file_config::FileConfig;

use crate::runner::RunnerSettings;
use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that participate in config resolution.
/// TOML file values override these where present.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub runtime: i64,
    pub max_loops: u64,
    pub workers: usize,
    pub singleton: bool,
    pub singleton_timeout: i64,
    pub lock_db: Option<PathBuf>,
    pub pidfile: Option<PathBuf>,
    pub pause_secs: u64,
    pub pause_interval_secs: u64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            runtime: 50,
            max_loops: 0,
            workers: 1,
            singleton: false,
            singleton_timeout: 3600,
            lock_db: None,
            pidfile: None,
            pause_secs: 1,
            pause_interval_secs: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub settings: RunnerSettings,
    pub singleton_timeout: i64,
    pub lock_db: Option<PathBuf>,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file
    /// config. TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let runtime = file.runtime.unwrap_or(cli.runtime);
        // Anything below one second means an unbounded runtime
        let runtime_max = if runtime < 1 {
            None
        } else {
            Some(Duration::from_secs(runtime as u64))
        };

        let max_iterations = file.max_loops.unwrap_or(cli.max_loops);
        let workers = file.workers.unwrap_or(cli.workers).max(1);
        let singleton = file.singleton.unwrap_or(cli.singleton);
        let singleton_timeout = file.singleton_timeout.unwrap_or(cli.singleton_timeout);
        let lock_db = file
            .lock_db
            .map(PathBuf::from)
            .or_else(|| cli.lock_db.clone());
        let pidfile = file
            .pidfile
            .map(PathBuf::from)
            .or_else(|| cli.pidfile.clone());
        let pause = Duration::from_secs(file.pause_secs.unwrap_or(cli.pause_secs));
        let pause_interval =
            Duration::from_secs(file.pause_interval_secs.unwrap_or(cli.pause_interval_secs));

        if singleton && workers > 1 {
            bail!("singleton mode cannot be combined with worker fan-out");
        }
        if singleton {
            match &lock_db {
                None => bail!("singleton mode requires a lock database path"),
                Some(path) => {
                    if let Some(parent) = path.parent() {
                        if !parent.as_os_str().is_empty() && !parent.exists() {
                            bail!("Lock database directory does not exist: {:?}", parent);
                        }
                    }
                }
            }
            if singleton_timeout < 1 {
                bail!("singleton timeout must be positive");
            }
        }

        Ok(AppConfig {
            settings: RunnerSettings {
                runtime_max,
                max_iterations,
                workers,
                singleton,
                pause,
                pause_interval,
                pidfile,
            },
            singleton_timeout,
            lock_db,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_resolve() {
        let config = AppConfig::resolve(&CliConfig::default(), None).unwrap();

        assert_eq!(config.settings.runtime_max, Some(Duration::from_secs(50)));
        assert_eq!(config.settings.max_iterations, 0);
        assert_eq!(config.settings.workers, 1);
        assert!(!config.settings.singleton);
        assert_eq!(config.settings.pause, Duration::from_secs(1));
        assert_eq!(config.settings.pause_interval, Duration::ZERO);
        assert_eq!(config.singleton_timeout, 3600);
    }

    #[test]
    fn test_file_overrides_cli() {
        let cli = CliConfig {
            runtime: 50,
            workers: 1,
            ..Default::default()
        };
        let file: FileConfig = toml::from_str(
            r#"
            runtime = 200
            workers = 3
            "#,
        )
        .unwrap();

        let config = AppConfig::resolve(&cli, Some(file)).unwrap();
        assert_eq!(config.settings.runtime_max, Some(Duration::from_secs(200)));
        assert_eq!(config.settings.workers, 3);
    }

    #[test]
    fn test_runtime_below_one_is_unbounded() {
        let cli = CliConfig {
            runtime: 0,
            ..Default::default()
        };
        let config = AppConfig::resolve(&cli, None).unwrap();
        assert_eq!(config.settings.runtime_max, None);

        let cli = CliConfig {
            runtime: -1,
            ..Default::default()
        };
        let config = AppConfig::resolve(&cli, None).unwrap();
        assert_eq!(config.settings.runtime_max, None);
    }

    #[test]
    fn test_workers_are_at_least_one() {
        let cli = CliConfig {
            workers: 0,
            ..Default::default()
        };
        let config = AppConfig::resolve(&cli, None).unwrap();
        assert_eq!(config.settings.workers, 1);
    }

    #[test]
    fn test_singleton_with_fanout_is_rejected() {
        let cli = CliConfig {
            singleton: true,
            workers: 2,
            lock_db: Some(PathBuf::from("locks.db")),
            ..Default::default()
        };
        assert!(AppConfig::resolve(&cli, None).is_err());
    }

    #[test]
    fn test_singleton_requires_lock_db() {
        let cli = CliConfig {
            singleton: true,
            lock_db: None,
            ..Default::default()
        };
        assert!(AppConfig::resolve(&cli, None).is_err());
    }

    #[test]
    fn test_singleton_rejects_missing_lock_db_directory() {
        let cli = CliConfig {
            singleton: true,
            lock_db: Some(PathBuf::from("/nonexistent/dir/locks.db")),
            ..Default::default()
        };
        assert!(AppConfig::resolve(&cli, None).is_err());
    }
}
