//! Environment parsing and validation for the media sync daemon.
//!
//! All runtime configuration is sourced from environment variables (see
//! the deployment docs for the full list). Parsing is fail-fast: a single
//! [`Settings::from_env`] call either returns a fully validated config or a
//! [`ConfigError`] naming the offending variable.

mod validation;

use std::time::Duration;

use chrono_tz::Tz;
use thiserror::Error;

pub use validation::{
    normalize_cookie_domain, parse_cookie_bundle, CookieEntry, CookieNormalizationReport,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("environment variable {name} has an invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Fully validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub source_users: Vec<String>,
    pub source_cookies_json: String,
    pub source_web_bearer_token: Option<String>,

    pub sink_api_id: String,
    pub sink_api_hash: String,
    pub sink_string_session: String,

    pub timezone: Tz,
    pub state_db_path: String,
    pub backfill_pages_per_run: u32,
    pub max_media_per_run: u32,
    pub download_tmp_dir: String,
    pub job_lock_ttl_seconds: u64,
    pub max_upload_video_bytes: u64,
    pub source_rate_limit_cooldown_seconds: u64,

    pub sync_daily_at: (u32, u32),
    pub scheduler_tick_seconds: u64,
    pub scheduler_run_on_start: bool,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_getter(|key| std::env::var(key).ok())
    }

    /// Core loader, parameterised over a variable getter so tests don't
    /// need to touch the real process environment.
    pub fn from_getter(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let source_users = parse_csv_handles(
            get("SOURCE_USERS")
                .ok_or(ConfigError::Missing("SOURCE_USERS"))?
                .as_str(),
        );

        let source_cookies_json =
            get("SOURCE_COOKIES_JSON").ok_or(ConfigError::Missing("SOURCE_COOKIES_JSON"))?;

        let sink_api_id = get("SINK_API_ID").ok_or(ConfigError::Missing("SINK_API_ID"))?;
        let sink_api_hash = get("SINK_API_HASH").ok_or(ConfigError::Missing("SINK_API_HASH"))?;
        let sink_string_session =
            get("SINK_STRING_SESSION").ok_or(ConfigError::Missing("SINK_STRING_SESSION"))?;

        let timezone_str = get("TZ").unwrap_or_else(|| "Asia/Shanghai".to_string());
        let timezone: Tz = timezone_str.parse().map_err(|_| ConfigError::Invalid {
            name: "TZ",
            value: timezone_str.clone(),
            reason: "not a recognized IANA timezone".to_string(),
        })?;

        let sync_daily_at = parse_hh_mm(
            &get("SYNC_DAILY_AT").unwrap_or_else(|| "09:00".to_string()),
            "SYNC_DAILY_AT",
        )?;

        Ok(Settings {
            source_users,
            source_cookies_json,
            source_web_bearer_token: get("SOURCE_WEB_BEARER_TOKEN"),
            sink_api_id,
            sink_api_hash,
            sink_string_session,
            timezone,
            state_db_path: get("STATE_DB_PATH").unwrap_or_else(|| "/data/state.sqlite".to_string()),
            backfill_pages_per_run: parse_u32(&get, "BACKFILL_PAGES_PER_RUN", 10)?,
            max_media_per_run: parse_u32(&get, "MAX_MEDIA_PER_RUN", 300)?,
            download_tmp_dir: get("DOWNLOAD_TMP_DIR").unwrap_or_else(|| "/tmp/work".to_string()),
            job_lock_ttl_seconds: parse_u64(&get, "JOB_LOCK_TTL_SECONDS", 3300)?,
            max_upload_video_bytes: parse_u64(&get, "MAX_UPLOAD_VIDEO_BYTES", 512 * 1024 * 1024)?,
            source_rate_limit_cooldown_seconds: parse_u64(
                &get,
                "SOURCE_RATE_LIMIT_COOLDOWN_SECONDS",
                7200,
            )?,
            sync_daily_at,
            scheduler_tick_seconds: parse_u64(&get, "SCHEDULER_TICK_SECONDS", 30)?,
            scheduler_run_on_start: get("SCHEDULER_RUN_ON_START")
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(false),
        })
    }

    pub fn job_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.job_lock_ttl_seconds)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_seconds)
    }
}

fn parse_csv_handles(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.strip_prefix('@').unwrap_or(s).to_string())
        .collect()
}

fn parse_u32(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u32,
) -> Result<u32, ConfigError> {
    match get(name) {
        None => Ok(default),
        Some(v) => v.trim().parse().map_err(|_| ConfigError::Invalid {
            name,
            value: v,
            reason: "expected a non-negative integer".to_string(),
        }),
    }
}

fn parse_u64(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match get(name) {
        None => Ok(default),
        Some(v) => v.trim().parse().map_err(|_| ConfigError::Invalid {
            name,
            value: v,
            reason: "expected a non-negative integer".to_string(),
        }),
    }
}

fn parse_hh_mm(raw: &str, name: &'static str) -> Result<(u32, u32), ConfigError> {
    let bad = || ConfigError::Invalid {
        name,
        value: raw.to_string(),
        reason: "expected 24-hour \"HH:MM\"".to_string(),
    };
    let (h, m) = raw.split_once(':').ok_or_else(bad)?;
    let hour: u32 = h.parse().map_err(|_| bad())?;
    let minute: u32 = m.parse().map_err(|_| bad())?;
    if hour > 23 || minute > 59 {
        return Err(bad());
    }
    Ok((hour, minute))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn getter(map: HashMap<&'static str, &'static str>) -> impl Fn(&str) -> Option<String> {
        move |key| map.get(key).map(|v| v.to_string())
    }

    fn required() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("SOURCE_USERS", "@alice, bob"),
            ("SOURCE_COOKIES_JSON", "[]"),
            ("SINK_API_ID", "1"),
            ("SINK_API_HASH", "hash"),
            ("SINK_STRING_SESSION", "session"),
        ])
    }

    #[test]
    fn strips_leading_at_and_trims_handles() {
        let settings = Settings::from_getter(getter(required())).unwrap();
        assert_eq!(settings.source_users, vec!["alice", "bob"]);
    }

    #[test]
    fn applies_defaults() {
        let settings = Settings::from_getter(getter(required())).unwrap();
        assert_eq!(settings.state_db_path, "/data/state.sqlite");
        assert_eq!(settings.max_media_per_run, 300);
        assert_eq!(settings.sync_daily_at, (9, 0));
        assert!(!settings.scheduler_run_on_start);
    }

    #[test]
    fn missing_required_var_is_an_error() {
        let mut vars = required();
        vars.remove("SINK_API_ID");
        let err = Settings::from_getter(getter(vars)).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("SINK_API_ID")));
    }

    #[test]
    fn rejects_bad_daily_at() {
        let mut vars = required();
        vars.insert("SYNC_DAILY_AT", "25:61");
        let err = Settings::from_getter(getter(vars)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "SYNC_DAILY_AT", .. }));
    }

    #[test]
    fn truthy_run_on_start_variants() {
        for v in ["1", "true", "yes", "on"] {
            let mut vars = required();
            vars.insert("SCHEDULER_RUN_ON_START", v);
            let settings = Settings::from_getter(getter(vars)).unwrap();
            assert!(settings.scheduler_run_on_start, "{v} should be truthy");
        }
    }
}
