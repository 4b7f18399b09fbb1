//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default Anthropic model used for classification.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";

/// Scanner configuration, built from `POSTAL_*` environment variables.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Mailbox identity used as the LMTP recipient.
    pub mail_user: String,
    /// Domain whose addresses may be used as per-message recipients.
    pub mail_domain: String,
    /// Root of the mail store's Maildir tree.
    pub maildir_path: PathBuf,
    /// Ledger database file.
    pub ledger_path: PathBuf,
    pub lmtp_host: String,
    pub lmtp_port: u16,
    /// Per-read/write timeout for the LMTP session.
    pub lmtp_timeout: Duration,
    pub api_key: SecretString,
    pub model: String,
    /// Hard timeout per classification attempt.
    pub ai_timeout: Duration,
    /// Classification attempts before failing closed.
    pub max_attempts: u32,
    /// Classification calls admitted per rolling minute.
    pub rate_limit_per_minute: usize,
    /// Interval between full staging re-sweeps.
    pub sweep_interval: Duration,
    /// Minimum age of a staged file before it is read.
    pub settle_interval: Duration,
    /// Upper bound on messages processed concurrently.
    pub max_workers: usize,
    /// Keep a copy of delivered messages under `.delivered`.
    pub archive_delivered: bool,
    /// Directory for rotated JSON log files (console only when unset).
    pub log_dir: Option<PathBuf>,
    /// Emit console logs as JSON.
    pub log_json: bool,
}

impl ScanConfig {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup, then validate it.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String, ConfigError> {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
        };

        let mail_user = required("POSTAL_MAIL_USER")?;
        let mail_domain = required("POSTAL_MAIL_DOMAIN")?;
        let api_key = SecretString::from(required("ANTHROPIC_API_KEY")?);

        let maildir_path = lookup("POSTAL_MAILDIR_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/mail"));
        let ledger_path = lookup("POSTAL_LEDGER_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| maildir_path.join(".postal-scan").join("ledger.db"));

        let config = Self {
            mail_user,
            mail_domain,
            ledger_path,
            maildir_path,
            lmtp_host: lookup("POSTAL_LMTP_HOST").unwrap_or_else(|| "imap".to_string()),
            lmtp_port: parse_or(&lookup, "POSTAL_LMTP_PORT", 24)?,
            lmtp_timeout: Duration::from_secs(parse_or(&lookup, "POSTAL_LMTP_TIMEOUT_SECS", 10)?),
            api_key,
            model: lookup("POSTAL_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            ai_timeout: Duration::from_secs(parse_or(&lookup, "POSTAL_AI_TIMEOUT_SECS", 45)?),
            max_attempts: parse_or(&lookup, "POSTAL_MAX_ATTEMPTS", 3)?,
            rate_limit_per_minute: parse_or(&lookup, "POSTAL_RATE_LIMIT_PER_MINUTE", 30)?,
            sweep_interval: Duration::from_secs(parse_or(&lookup, "POSTAL_SWEEP_INTERVAL_SECS", 60)?),
            settle_interval: Duration::from_millis(parse_or(
                &lookup,
                "POSTAL_SETTLE_INTERVAL_MS",
                2000,
            )?),
            max_workers: parse_or(&lookup, "POSTAL_MAX_WORKERS", 4)?,
            archive_delivered: parse_or(&lookup, "POSTAL_ARCHIVE_DELIVERED", true)?,
            log_dir: lookup("POSTAL_LOG_DIR").map(PathBuf::from),
            log_json: parse_or(&lookup, "POSTAL_LOG_JSON", false)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check identities and numeric ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self
            .mail_user
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(invalid("POSTAL_MAIL_USER", "only [a-zA-Z0-9_-] allowed"));
        }
        if !self
            .mail_domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        {
            return Err(invalid("POSTAL_MAIL_DOMAIN", "only [a-zA-Z0-9.-] allowed"));
        }
        if self.lmtp_port == 0 {
            return Err(invalid("POSTAL_LMTP_PORT", "must be 1-65535"));
        }
        if !(10..=120).contains(&self.ai_timeout.as_secs()) {
            return Err(invalid("POSTAL_AI_TIMEOUT_SECS", "must be 10-120"));
        }
        if !(1..=10).contains(&self.max_attempts) {
            return Err(invalid("POSTAL_MAX_ATTEMPTS", "must be 1-10"));
        }
        if !(1..=100).contains(&self.rate_limit_per_minute) {
            return Err(invalid("POSTAL_RATE_LIMIT_PER_MINUTE", "must be 1-100"));
        }
        if !(10..=3600).contains(&self.sweep_interval.as_secs()) {
            return Err(invalid("POSTAL_SWEEP_INTERVAL_SECS", "must be 10-3600"));
        }
        if self.max_workers == 0 || self.max_workers > 64 {
            return Err(invalid("POSTAL_MAX_WORKERS", "must be 1-64"));
        }
        Ok(())
    }

    /// Directory holding `<id>.mail` artifacts awaiting classification.
    pub fn staging_dir(&self) -> PathBuf {
        self.maildir_path.join(".staging")
    }

    /// Quarantine folder inside the user's Maildir.
    pub fn quarantine_dir(&self) -> PathBuf {
        self.maildir_path
            .join(&self.mail_user)
            .join(".Quarantine")
            .join("cur")
    }

    /// Archive of delivered artifacts, when enabled.
    pub fn delivered_dir(&self) -> Option<PathBuf> {
        self.archive_delivered
            .then(|| self.staging_dir().join(".delivered"))
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn base_env() -> HashMap<&'static str, String> {
        HashMap::from([
            ("POSTAL_MAIL_USER", "alice".to_string()),
            ("POSTAL_MAIL_DOMAIN", "example.com".to_string()),
            ("ANTHROPIC_API_KEY", "sk-test".to_string()),
        ])
    }

    fn load(env: &HashMap<&'static str, String>) -> Result<ScanConfig, ConfigError> {
        ScanConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_applied() {
        let config = load(&base_env()).unwrap();
        assert_eq!(config.lmtp_host, "imap");
        assert_eq!(config.lmtp_port, 24);
        assert_eq!(config.ai_timeout, Duration::from_secs(45));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.rate_limit_per_minute, 30);
        assert_eq!(config.model, DEFAULT_MODEL);
        assert!(config.archive_delivered);
        assert_eq!(config.staging_dir(), PathBuf::from("/var/mail/.staging"));
        assert_eq!(
            config.quarantine_dir(),
            PathBuf::from("/var/mail/alice/.Quarantine/cur")
        );
    }

    #[test]
    fn missing_api_key_rejected() {
        let mut env = base_env();
        env.remove("ANTHROPIC_API_KEY");
        match load(&env) {
            Err(ConfigError::MissingEnvVar(key)) => assert_eq!(key, "ANTHROPIC_API_KEY"),
            other => panic!("Expected MissingEnvVar, got {:?}", other),
        }
    }

    #[test]
    fn invalid_mail_user_rejected() {
        let mut env = base_env();
        env.insert("POSTAL_MAIL_USER", "alice; rm -rf".to_string());
        assert!(load(&env).is_err());
    }

    #[test]
    fn rate_limit_out_of_range_rejected() {
        let mut env = base_env();
        env.insert("POSTAL_RATE_LIMIT_PER_MINUTE", "500".to_string());
        assert!(load(&env).is_err());
    }

    #[test]
    fn unparseable_number_rejected() {
        let mut env = base_env();
        env.insert("POSTAL_LMTP_PORT", "twenty-four".to_string());
        match load(&env) {
            Err(ConfigError::InvalidValue { key, .. }) => assert_eq!(key, "POSTAL_LMTP_PORT"),
            other => panic!("Expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn archive_can_be_disabled() {
        let mut env = base_env();
        env.insert("POSTAL_ARCHIVE_DELIVERED", "false".to_string());
        let config = load(&env).unwrap();
        assert!(config.delivered_dir().is_none());
    }
}
