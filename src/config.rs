use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::{DEFAULT_MAIL_QUEUE_CAPACITY, DEFAULT_SESSION_LIFETIME, QUERY_TIMEOUT};

/// Startup settings, read once from `BOOKINGS_*` environment variables.
/// The mail fields configure a `ReservationEngine` and its mail worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub query_timeout: Duration,
    pub compact_threshold: u64,
    pub session_lifetime: Duration,
    pub mail_queue: usize,
    pub mail_from: String,
    pub owner_email: String,
    pub template_dir: PathBuf,
    /// Room names created when the store is empty.
    pub rooms: Vec<String>,
    /// Admin account created at startup when no user has this email.
    pub admin_email: Option<String>,
    pub admin_password: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| -> Option<u64> {
            let raw = lookup(key)?;
            match u64::from_str(raw.trim()) {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "ignoring malformed setting");
                    None
                }
            }
        };
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        Self {
            data_dir: PathBuf::from(text("BOOKINGS_DATA_DIR", "./data")),
            metrics_port: parsed("BOOKINGS_METRICS_PORT").and_then(|p| u16::try_from(p).ok()),
            query_timeout: parsed("BOOKINGS_QUERY_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(QUERY_TIMEOUT),
            compact_threshold: parsed("BOOKINGS_COMPACT_THRESHOLD").unwrap_or(1000),
            session_lifetime: parsed("BOOKINGS_SESSION_LIFETIME_SECS")
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_SESSION_LIFETIME),
            mail_queue: parsed("BOOKINGS_MAIL_QUEUE")
                .and_then(|n| usize::try_from(n).ok())
                .unwrap_or(DEFAULT_MAIL_QUEUE_CAPACITY),
            mail_from: text("BOOKINGS_MAIL_FROM", "me@here.com"),
            owner_email: text("BOOKINGS_OWNER_EMAIL", "me@here.com"),
            template_dir: PathBuf::from(text("BOOKINGS_TEMPLATE_DIR", "./email-templates")),
            rooms: lookup("BOOKINGS_ROOMS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|name| !name.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            admin_email: lookup("BOOKINGS_ADMIN_EMAIL")
                .map(|raw| raw.trim().to_string())
                .filter(|email| !email.is_empty()),
            admin_password: lookup("BOOKINGS_ADMIN_PASSWORD").filter(|p| !p.is_empty()),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookings.wal")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let c = config(&[]);
        assert_eq!(c.data_dir, PathBuf::from("./data"));
        assert_eq!(c.metrics_port, None);
        assert_eq!(c.query_timeout, Duration::from_secs(3));
        assert_eq!(c.compact_threshold, 1000);
        assert_eq!(c.session_lifetime, Duration::from_secs(86_400));
        assert_eq!(c.mail_queue, 100);
        assert_eq!(c.mail_from, "me@here.com");
        assert_eq!(c.owner_email, "me@here.com");
        assert!(c.rooms.is_empty());
        assert_eq!(c.admin_email, None);
        assert_eq!(c.admin_password, None);
        assert_eq!(c.wal_path(), PathBuf::from("./data/bookings.wal"));
    }

    #[test]
    fn overrides_and_malformed_values() {
        let c = config(&[
            ("BOOKINGS_METRICS_PORT", "9100"),
            ("BOOKINGS_QUERY_TIMEOUT_MS", "250"),
            ("BOOKINGS_COMPACT_THRESHOLD", "lots"),
            ("BOOKINGS_MAIL_QUEUE", " 8 "),
            ("BOOKINGS_ROOMS", "General's Quarters, Major's Suite,,"),
        ]);
        assert_eq!(c.metrics_port, Some(9100));
        assert_eq!(c.query_timeout, Duration::from_millis(250));
        assert_eq!(c.compact_threshold, 1000);
        assert_eq!(c.mail_queue, 8);
        assert_eq!(c.rooms, vec!["General's Quarters", "Major's Suite"]);
    }

    #[test]
    fn admin_seed_credentials() {
        let c = config(&[
            ("BOOKINGS_ADMIN_EMAIL", " admin@here.com "),
            ("BOOKINGS_ADMIN_PASSWORD", "s3cret pass"),
        ]);
        assert_eq!(c.admin_email.as_deref(), Some("admin@here.com"));
        assert_eq!(c.admin_password.as_deref(), Some("s3cret pass"));

        let c = config(&[("BOOKINGS_ADMIN_EMAIL", "  "), ("BOOKINGS_ADMIN_PASSWORD", "")]);
        assert_eq!(c.admin_email, None);
        assert_eq!(c.admin_password, None);
    }

    #[test]
    fn out_of_range_port_is_ignored() {
        assert_eq!(config(&[("BOOKINGS_METRICS_PORT", "70000")]).metrics_port, None);
    }
}
