//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The sign-in password is loaded from SESSION_PASSWORD env var or
//! password_file, never stored in the TOML directly to avoid leaking secrets.

use common::Secret;
use serde::Deserialize;
use session_gateway::{CoordinatorConfig, TOKEN_EXPIRED_CODE};
use session_provider::RenewalFailurePolicy;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// HTTP proxy settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub upstream_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// How long in-flight requests get to finish after a shutdown signal
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

/// Session and renewal settings
#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    /// Where the credential survives restarts. Unset keeps it in memory only.
    #[serde(default)]
    pub credential_file: Option<PathBuf>,
    #[serde(default = "default_sign_in_path")]
    pub sign_in_path: String,
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,
    #[serde(default = "default_profile_path")]
    pub profile_path: String,
    #[serde(default = "default_expired_code")]
    pub expired_code: String,
    #[serde(default)]
    pub renewal_failure_policy: RenewalFailurePolicy,
    /// Longest a request waits on another request's renewal
    #[serde(default)]
    pub follower_timeout_secs: Option<u64>,
    #[serde(default = "default_credential_max_age_days")]
    pub credential_max_age_days: u64,
    /// Headless sign-in at startup when no credential is stored
    #[serde(default)]
    pub sign_in: Option<SignInConfig>,
}

#[derive(Debug, Deserialize)]
pub struct SignInConfig {
    pub email: String,
    #[serde(skip)]
    pub password: Option<Secret<String>>,
    /// Path to a file containing the password (alternative to SESSION_PASSWORD env var)
    #[serde(default)]
    pub password_file: Option<PathBuf>,
}

fn default_timeout() -> u64 {
    60
}

fn default_max_connections() -> usize {
    1000
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_sign_in_path() -> String {
    session_auth::constants::SIGN_IN_PATH.to_string()
}

fn default_refresh_path() -> String {
    session_auth::constants::REFRESH_PATH.to_string()
}

fn default_profile_path() -> String {
    session_auth::constants::PROFILE_PATH.to_string()
}

fn default_expired_code() -> String {
    TOKEN_EXPIRED_CODE.to_string()
}

fn default_credential_max_age_days() -> u64 {
    session_auth::constants::CREDENTIAL_MAX_AGE.as_secs() / 86_400
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            credential_file: None,
            sign_in_path: default_sign_in_path(),
            refresh_path: default_refresh_path(),
            profile_path: default_profile_path(),
            expired_code: default_expired_code(),
            renewal_failure_policy: RenewalFailurePolicy::default(),
            follower_timeout_secs: None,
            credential_max_age_days: default_credential_max_age_days(),
            sign_in: None,
        }
    }
}

impl ProxyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl AuthConfig {
    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            policy: self.renewal_failure_policy,
            follower_timeout: self.follower_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn credential_max_age(&self) -> Duration {
        Duration::from_secs(self.credential_max_age_days * 86_400)
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Sign-in password resolution order:
    /// 1. SESSION_PASSWORD env var
    /// 2. password_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if !config.proxy.upstream_url.starts_with("http://")
            && !config.proxy.upstream_url.starts_with("https://")
        {
            return Err(common::Error::invalid(
                "upstream_url",
                format!(
                    "must start with http:// or https://, got: {}",
                    config.proxy.upstream_url
                ),
            ));
        }
        if config.proxy.timeout_secs == 0 {
            return Err(common::Error::invalid("timeout_secs", "must be greater than 0"));
        }
        if config.proxy.max_connections == 0 {
            return Err(common::Error::invalid("max_connections", "must be greater than 0"));
        }
        if config.auth.expired_code.trim().is_empty() {
            return Err(common::Error::invalid("expired_code", "must not be empty"));
        }
        if config.auth.follower_timeout_secs == Some(0) {
            return Err(common::Error::invalid(
                "follower_timeout_secs",
                "must be greater than 0 when set",
            ));
        }
        if config.auth.credential_max_age_days == 0 {
            return Err(common::Error::invalid(
                "credential_max_age_days",
                "must be greater than 0",
            ));
        }

        if let Some(sign_in) = config.auth.sign_in.as_mut() {
            sign_in.resolve_password()?;
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("session-proxy.toml")
    }
}

impl SignInConfig {
    fn resolve_password(&mut self) -> common::Result<()> {
        if let Ok(password) = std::env::var("SESSION_PASSWORD") {
            self.password = Secret::from_trimmed(&password);
        } else if let Some(ref password_file) = self.password_file {
            let raw = std::fs::read_to_string(password_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read password_file {}: {e}",
                    password_file.display()
                ))
            })?;
            self.password = Secret::from_trimmed(&raw);
        }

        if self.password.is_none() {
            return Err(common::Error::invalid(
                "auth.sign_in",
                "needs SESSION_PASSWORD or a non-empty password_file",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    const MINIMAL: &str = r#"
[proxy]
listen_addr = "127.0.0.1:8080"
upstream_url = "https://api.example.com"
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&write_config(&dir, MINIMAL)).unwrap();

        assert_eq!(config.proxy.upstream_url, "https://api.example.com");
        assert_eq!(config.proxy.timeout_secs, 60);
        assert_eq!(config.proxy.max_connections, 1000);
        assert_eq!(config.proxy.drain_timeout(), Duration::from_secs(30));
        assert!(config.auth.credential_file.is_none());
        assert_eq!(config.auth.refresh_path, "/refresh");
        assert_eq!(config.auth.profile_path, "/me");
        assert_eq!(config.auth.expired_code, "token.expired");
        assert_eq!(config.auth.renewal_failure_policy, RenewalFailurePolicy::KeepSession);
        assert_eq!(config.auth.credential_max_age(), Duration::from_secs(30 * 86_400));
        assert!(config.auth.sign_in.is_none());
    }

    #[test]
    fn full_auth_section() {
        let dir = tempfile::tempdir().unwrap();
        let toml = r#"
[proxy]
listen_addr = "0.0.0.0:9000"
upstream_url = "http://localhost:3333"
timeout_secs = 10

[auth]
credential_file = "/var/lib/session-proxy/credential.json"
refresh_path = "/auth/refresh"
expired_code = "jwt.stale"
renewal_failure_policy = "sign_out_on_rejection"
follower_timeout_secs = 15
credential_max_age_days = 7
"#;
        let config = Config::load(&write_config(&dir, toml)).unwrap();

        assert_eq!(config.proxy.timeout(), Duration::from_secs(10));
        assert_eq!(
            config.auth.credential_file.as_deref(),
            Some(Path::new("/var/lib/session-proxy/credential.json"))
        );
        assert_eq!(config.auth.refresh_path, "/auth/refresh");
        assert_eq!(config.auth.sign_in_path, "/sessions");
        assert_eq!(config.auth.expired_code, "jwt.stale");

        let coordinator = config.auth.coordinator();
        assert_eq!(coordinator.policy, RenewalFailurePolicy::SignOutOnRejection);
        assert_eq!(coordinator.follower_timeout, Some(Duration::from_secs(15)));
        assert_eq!(config.auth.credential_max_age(), Duration::from_secs(7 * 86_400));
    }

    #[test]
    fn missing_file_is_an_error() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(common::Error::Io(_))));
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(&write_config(&dir, "not valid {{{{ toml"));
        assert!(matches!(result, Err(common::Error::Toml(_))));
    }

    #[test]
    fn unknown_policy_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let toml = format!("{MINIMAL}\n[auth]\nrenewal_failure_policy = \"panic\"\n");
        assert!(Config::load(&write_config(&dir, &toml)).is_err());
    }

    #[test]
    fn upstream_url_requires_http_scheme() {
        let dir = tempfile::tempdir().unwrap();
        let toml = r#"
[proxy]
listen_addr = "127.0.0.1:8080"
upstream_url = "ftp://example.com"
"#;
        let err = Config::load(&write_config(&dir, toml)).unwrap_err();
        assert!(err.to_string().contains("upstream_url"), "got: {err}");
    }

    #[test]
    fn zero_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for (section, field) in [
            ("proxy", "timeout_secs"),
            ("proxy", "max_connections"),
            ("auth", "follower_timeout_secs"),
            ("auth", "credential_max_age_days"),
        ] {
            let toml = if section == "proxy" {
                format!(
                    "[proxy]\nlisten_addr = \"127.0.0.1:8080\"\nupstream_url = \"https://api.example.com\"\n{field} = 0\n"
                )
            } else {
                format!("{MINIMAL}\n[auth]\n{field} = 0\n")
            };
            let err = Config::load(&write_config(&dir, &toml)).unwrap_err();
            assert!(err.to_string().contains(field), "{field}: {err}");
        }
    }

    #[test]
    fn sign_in_password_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let toml = format!("{MINIMAL}\n[auth.sign_in]\nemail = \"alice@example.com\"\n");

        unsafe { set_env("SESSION_PASSWORD", "hunter2") };
        let config = Config::load(&write_config(&dir, &toml)).unwrap();
        unsafe { remove_env("SESSION_PASSWORD") };

        let sign_in = config.auth.sign_in.unwrap();
        assert_eq!(sign_in.email, "alice@example.com");
        assert_eq!(sign_in.password.unwrap().expose(), "hunter2");
    }

    #[test]
    fn sign_in_password_from_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let password_path = dir.path().join("password");
        std::fs::write(&password_path, "from-file\n").unwrap();
        let toml = format!(
            "{MINIMAL}\n[auth.sign_in]\nemail = \"alice@example.com\"\npassword_file = \"{}\"\n",
            password_path.display()
        );

        unsafe { remove_env("SESSION_PASSWORD") };
        let config = Config::load(&write_config(&dir, &toml)).unwrap();
        assert_eq!(
            config.auth.sign_in.unwrap().password.unwrap().expose(),
            "from-file"
        );
    }

    #[test]
    fn sign_in_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let password_path = dir.path().join("password");
        std::fs::write(&password_path, "from-file").unwrap();
        let toml = format!(
            "{MINIMAL}\n[auth.sign_in]\nemail = \"alice@example.com\"\npassword_file = \"{}\"\n",
            password_path.display()
        );

        unsafe { set_env("SESSION_PASSWORD", "from-env") };
        let config = Config::load(&write_config(&dir, &toml)).unwrap();
        unsafe { remove_env("SESSION_PASSWORD") };

        assert_eq!(
            config.auth.sign_in.unwrap().password.unwrap().expose(),
            "from-env"
        );
    }

    #[test]
    fn sign_in_without_password_is_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let toml = format!("{MINIMAL}\n[auth.sign_in]\nemail = \"alice@example.com\"\n");

        unsafe { remove_env("SESSION_PASSWORD") };
        let err = Config::load(&write_config(&dir, &toml)).unwrap_err();
        assert!(err.to_string().contains("SESSION_PASSWORD"), "got: {err}");
    }

    #[test]
    fn resolve_path_precedence() {
        let _lock = ENV_MUTEX.lock().unwrap();

        unsafe { set_env("CONFIG_PATH", "/etc/from-env.toml") };
        assert_eq!(
            Config::resolve_path(Some("/cli.toml")),
            PathBuf::from("/cli.toml")
        );
        assert_eq!(
            Config::resolve_path(None),
            PathBuf::from("/etc/from-env.toml")
        );

        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(
            Config::resolve_path(None),
            PathBuf::from("session-proxy.toml")
        );
    }
}
