//! Command-line surface of the `hx` binary.
//!
//! The only place raw arguments are looked at. Flags override the optional
//! TOML file, which overrides the built-in defaults.

use std::path::PathBuf;

use clap::Parser;

use crate::config::fds::FdMap;
use crate::config::loader::{load_config, ConfigError};
use crate::config::schema::ServingConfig;
use crate::config::validation::validate_config;

#[derive(Debug, Parser)]
#[command(name = "hx")]
#[command(version, about = "Multi-process HTTP/HTTPS serving frontend with page caching and hot reload", long_about = None)]
pub struct Cli {
    /// Restart the workers when files in the watched tree change
    #[arg(long, overrides_with = "no_reload")]
    pub reload: bool,

    /// Do not watch for changes, whatever the file says
    #[arg(long = "no-reload", overrides_with = "reload")]
    pub no_reload: bool,

    /// Show warnings
    #[arg(short = 'l', long)]
    pub loud: bool,

    /// Port to serve plaintext HTTP on [default: 8000]
    #[arg(long = "http_port", alias = "http-port", value_name = "PORT")]
    pub http_port: Option<u16>,

    /// Port to serve HTTPS on (requires --key and --cert)
    #[arg(long = "https_port", alias = "https-port", value_name = "PORT")]
    pub https_port: Option<u16>,

    /// Port of the shared cache server [default: 8080]
    #[arg(long = "cache_port", alias = "cache-port", value_name = "PORT")]
    pub cache_port: Option<u16>,

    /// Run a single cache server shared by every worker
    #[arg(short = 'g', long = "global_cache", alias = "global-cache", overrides_with = "no_global_cache")]
    pub global_cache: bool,

    /// Keep the cache per worker, whatever the file says
    #[arg(long = "no-global_cache", alias = "no-global-cache", overrides_with = "global_cache")]
    pub no_global_cache: bool,

    /// Disable the page cache
    #[arg(short = 'n', long, overrides_with = "cache")]
    pub nocache: bool,

    /// Enable the page cache, whatever the file says
    #[arg(long, overrides_with = "nocache")]
    pub cache: bool,

    /// Number of worker processes (0 serves from this process) [default: 0]
    #[arg(short = 'w', long, value_name = "N")]
    pub workers: Option<usize>,

    /// Absolute path to the TLS private key (PEM)
    #[arg(long, value_name = "PATH")]
    pub key: Option<PathBuf>,

    /// Absolute path to the TLS certificate chain (PEM)
    #[arg(long, value_name = "PATH")]
    pub cert: Option<PathBuf>,

    /// Inherited listener descriptors. Set by the supervisor; DO NOT SET THIS
    #[arg(long, hide = true, value_name = "PORT:FD,...")]
    pub fd: Option<FdMap>,

    /// Run in the background
    #[arg(short = 'd', long, overrides_with = "no_daemonize")]
    pub daemonize: bool,

    /// Stay in the foreground, whatever the file says
    #[arg(long = "no-daemonize", overrides_with = "daemonize")]
    pub no_daemonize: bool,

    /// Development mode: one process, verbose errors
    #[arg(long, overrides_with = "no_dev")]
    pub dev: bool,

    /// Leave development mode, whatever the file says
    #[arg(long = "no-dev", overrides_with = "dev")]
    pub no_dev: bool,

    /// Override the hosted application's address (testing only)
    #[arg(long, value_name = "ADDR")]
    pub wsgi: Option<String>,

    /// TOML configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

/// Environment variable carrying the supervisor's resolved configuration
/// (JSON) to re-executed workers.
pub const WORKER_CONFIG_ENV: &str = "HX_WORKER_CONFIG";

impl Cli {
    /// Build and validate the configuration record.
    pub fn into_config(self) -> Result<ServingConfig, ConfigError> {
        let handoff = std::env::var(WORKER_CONFIG_ENV).ok();
        self.into_config_with(handoff)
    }

    /// A worker (`--fd`) with a handed-over configuration uses it as is;
    /// everything else resolves file and flags.
    fn into_config_with(self, handoff: Option<String>) -> Result<ServingConfig, ConfigError> {
        let config = match (self.fd.clone(), handoff) {
            (Some(fds), Some(json)) => {
                let mut config: ServingConfig =
                    serde_json::from_str(&json).map_err(ConfigError::Handoff)?;
                config.inherited_fds = Some(fds);
                config
            }
            _ => {
                let mut config = match &self.config {
                    Some(path) => load_config(path)?,
                    None => ServingConfig::default(),
                };
                self.apply(&mut config);
                config
            }
        };
        validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }

    fn apply(self, config: &mut ServingConfig) {
        if let Some(port) = self.http_port {
            config.http_port = Some(port);
        }
        if let Some(port) = self.https_port {
            config.https_port = Some(port);
        }
        if let Some(port) = self.cache_port {
            config.cache_port = Some(port);
        }
        if let Some(workers) = self.workers {
            config.worker_count = workers;
        }
        if let Some(key) = self.key {
            config.tls_key_path = Some(key);
        }
        if let Some(cert) = self.cert {
            config.tls_cert_path = Some(cert);
        }
        if let Some(app) = self.wsgi {
            config.app_override = Some(app);
        }
        if self.fd.is_some() {
            config.inherited_fds = self.fd;
        }
        config.loud |= self.loud;
        overlay(&mut config.reload_enabled, self.reload, self.no_reload);
        overlay(&mut config.global_cache, self.global_cache, self.no_global_cache);
        overlay(&mut config.nocache, self.nocache, self.cache);
        overlay(&mut config.daemonize, self.daemonize, self.no_daemonize);
        overlay(&mut config.dev_mode, self.dev, self.no_dev);
    }
}

/// A switch and its negation; the last one given wins, neither keeps the file.
fn overlay(field: &mut bool, on: bool, off: bool) {
    if on {
        *field = true;
    } else if off {
        *field = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::validation::ValidationError;
    use std::io::Write;

    fn parse(args: &[&str]) -> Result<ServingConfig, ConfigError> {
        let mut argv = vec!["hx"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap().into_config_with(None)
    }

    #[test]
    fn no_flags_gives_defaults() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.http_port, Some(8000));
        assert_eq!(config.https_port, None);
        assert_eq!(config.worker_count, 0);
        assert!(!config.reload_enabled);
    }

    #[test]
    fn short_and_long_flags() {
        let config = parse(&["-w", "2", "-n", "-l", "--http_port", "8080", "--reload", "-d"]).unwrap();
        assert_eq!(config.worker_count, 2);
        assert!(config.nocache);
        assert!(config.loud);
        assert!(config.reload_enabled);
        assert!(config.daemonize);
        assert_eq!(config.http_port, Some(8080));
    }

    #[test]
    fn https_without_key_is_config_error() {
        let err = parse(&["--https_port", "8443", "--cert", "/tmp/cert.pem"]).unwrap_err();
        match err {
            ConfigError::Validation(errors) => {
                assert_eq!(errors, vec![ValidationError::IncompleteTls { missing: "key" }]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn conflicting_cache_flags_rejected() {
        let err = parse(&["-g", "-n"]).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn fd_flag_marks_worker() {
        let config = parse(&["--http_port", "8000", "--fd", "8000:7"]).unwrap();
        assert_eq!(config.inherited_fds.unwrap().get(8000), Some(7));
    }

    #[test]
    fn malformed_fd_rejected_by_parser() {
        assert!(Cli::try_parse_from(["hx", "--fd", "nonsense"]).is_err());
    }

    #[test]
    fn flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "http_port = 9100\nworker_count = 3\n[cache]\nttl_secs = 5").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = parse(&["-c", &path, "-w", "1"]).unwrap();
        assert_eq!(config.http_port, Some(9100));
        assert_eq!(config.worker_count, 1);
        assert_eq!(config.cache.ttl_secs, 5);
    }

    #[test]
    fn negated_flags_turn_off_file_settings() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "daemonize = true\nreload_enabled = true\nnocache = true").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let kept = parse(&["-c", &path]).unwrap();
        assert!(kept.daemonize && kept.reload_enabled && kept.nocache);

        let config = parse(&["-c", &path, "--no-daemonize", "--no-reload", "--cache"]).unwrap();
        assert!(!config.daemonize);
        assert!(!config.reload_enabled);
        assert!(!config.nocache);
    }

    #[test]
    fn last_of_a_switch_pair_wins() {
        let config = parse(&["--dev", "--no-dev"]).unwrap();
        assert!(!config.dev_mode);
        let config = parse(&["--no-daemonize", "-d"]).unwrap();
        assert!(config.daemonize);
    }

    #[test]
    fn worker_uses_handed_over_config() {
        let resolved = ServingConfig {
            http_port: Some(41234),
            worker_count: 3,
            nocache: true,
            ..ServingConfig::default()
        };
        let json = serde_json::to_string(&resolved).unwrap();
        // Flags other than --fd are ignored once the supervisor resolved them.
        let cli = Cli::try_parse_from(["hx", "-c", "/nonexistent.toml", "--fd", "41234:7"]).unwrap();

        let config = cli.into_config_with(Some(json)).unwrap();
        assert_eq!(config.http_port, Some(41234));
        assert_eq!(config.worker_count, 3);
        assert!(config.nocache);
        assert_eq!(config.inherited_fds.unwrap().get(41234), Some(7));
    }

    #[test]
    fn unreadable_handoff_is_config_error() {
        let cli = Cli::try_parse_from(["hx", "--fd", "8000:7"]).unwrap();
        let err = cli.into_config_with(Some("{not json".into())).unwrap_err();
        assert!(matches!(err, ConfigError::Handoff(_)));
    }

    #[test]
    fn wsgi_overrides_application() {
        let config = parse(&["--wsgi", "http://127.0.0.1:5000"]).unwrap();
        assert_eq!(config.upstream_address(), "http://127.0.0.1:5000");
    }
}
