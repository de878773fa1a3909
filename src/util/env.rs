//! Environment access for the daemon and CLI. `.env` is loaded lazily on the
//! first read, so callers never see a half-configured process.
use std::str::FromStr;
use std::sync::Once;
use std::time::Duration;
use tracing::info;

static INIT: Once = Once::new();

/// Used when none of the URL variables is set.
pub const DEFAULT_DATABASE_URL: &str = "sqlite://catalog.db?mode=rwc";

/// Keys that may name the store, most specific first.
const DATABASE_URL_KEYS: &[&str] = &["CATALOG_DATABASE_URL", "DATABASE_URL", "DB_URL"];

pub fn init_env() {
    INIT.call_once(crate::env_boot::ensure_dotenv);
}

/// Trimmed value of `key`; unset and blank are both `None`.
pub fn env_opt(key: &str) -> Option<String> {
    init_env();
    let raw = std::env::var(key).ok()?;
    let value = raw.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// `key` parsed as `T`, or `default` when unset or unparsable.
pub fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env_opt(key)
        .and_then(|raw| raw.parse::<T>().ok())
        .unwrap_or(default)
}

/// Whole seconds from `key` as a `Duration`; zero is treated as unset.
pub fn env_secs(key: &str, default_secs: u64) -> Duration {
    match env_parse(key, default_secs) {
        0 => Duration::from_secs(default_secs),
        secs => Duration::from_secs(secs),
    }
}

pub fn db_url() -> String {
    DATABASE_URL_KEYS
        .iter()
        .find_map(|k| env_opt(k))
        .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string())
}

/// Secrets become `***`; credentials embedded in URLs are masked.
fn redact_value(key: &str, val: &str) -> String {
    let upper = key.to_ascii_uppercase();
    if ["PASSWORD", "SECRET", "TOKEN"].iter().any(|s| upper.contains(s)) {
        return "***".to_string();
    }
    let val = val.trim();
    match url::Url::parse(val) {
        Ok(mut u) if !u.username().is_empty() || u.password().is_some() => {
            let _ = u.set_username("***");
            let _ = u.set_password(Some("***"));
            u.to_string()
        }
        _ => val.to_string(),
    }
}

/// Logs a redacted snapshot of `also_log` under `title` and fails when any
/// of `required` is unset.
pub fn preflight_check(title: &str, required: &[&str], also_log: &[&str]) -> anyhow::Result<()> {
    let snapshot: Vec<(&str, String)> = also_log
        .iter()
        .map(|&k| (k, redact_value(k, &env_opt(k).unwrap_or_default())))
        .collect();
    info!(target = "preflight", title, snapshot = ?snapshot, "configuration snapshot");

    let missing: Vec<&str> = required.iter().copied().filter(|k| env_opt(k).is_none()).collect();
    if !missing.is_empty() {
        anyhow::bail!("missing required env: {:?}", missing);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_credentials_in_urls() {
        let out = redact_value("FEED_BASE_URL", "https://user:pw@feeds.example.com/api");
        assert!(!out.contains("pw"));
        assert!(out.contains("feeds.example.com"));
    }

    #[test]
    fn redacts_secret_keys_entirely() {
        assert_eq!(redact_value("FEED_TOKEN", "abc"), "***");
    }

    #[test]
    fn leaves_plain_values_alone() {
        assert_eq!(redact_value("GRAB_DAYS", " 2 "), "2");
    }

    #[test]
    fn env_secs_falls_back_on_zero_and_garbage() {
        std::env::set_var("CATALOG_TEST_ZERO_SECS", "0");
        std::env::set_var("CATALOG_TEST_BAD_SECS", "soon");
        assert_eq!(env_secs("CATALOG_TEST_ZERO_SECS", 7), Duration::from_secs(7));
        assert_eq!(env_secs("CATALOG_TEST_BAD_SECS", 9), Duration::from_secs(9));
    }

    #[test]
    fn blank_values_read_as_unset_and_are_trimmed() {
        std::env::set_var("CATALOG_TEST_BLANK", "   ");
        std::env::set_var("CATALOG_TEST_PADDED", " 12 ");
        assert_eq!(env_opt("CATALOG_TEST_BLANK"), None);
        assert_eq!(env_parse("CATALOG_TEST_PADDED", 0u32), 12);
        assert!(preflight_check("test", &["CATALOG_TEST_BLANK"], &[]).is_err());
    }
}
