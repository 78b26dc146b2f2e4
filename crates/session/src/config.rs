use std::path::PathBuf;
use std::time::Duration;

use studio_core::StudioError;

/// Session configuration loaded from environment variables.
///
/// All fields have defaults suitable for a backend on the local machine.
#[derive(Debug, Clone)]
pub struct StudioConfig {
    /// Backend HTTP address (default: `http://127.0.0.1:8188`).
    pub server_url: String,
    /// History poll fallback interval (default: 2s).
    pub poll_interval: Duration,
    /// Give up on a session stuck in Queued/Executing after this long.
    /// `None` (the default) waits for a manual interrupt.
    pub execution_timeout: Option<Duration>,
    /// User-data file holding the generation history.
    pub history_file: String,
    /// User-data file holding saved prompts.
    pub prompts_file: String,
    /// User-data file holding favourite filenames.
    pub favourites_file: String,
    /// Directory whose `<mode>.json` files replace the built-in templates.
    pub template_dir: Option<PathBuf>,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8188".to_string(),
            poll_interval: Duration::from_millis(2000),
            execution_timeout: None,
            history_file: "mobile_history".to_string(),
            prompts_file: "mobile_prompts".to_string(),
            favourites_file: "mobile_favourites".to_string(),
            template_dir: None,
        }
    }
}

impl StudioConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                         | Default                 |
    /// |---------------------------------|-------------------------|
    /// | `COMFYUI_SERVER`                | `http://127.0.0.1:8188` |
    /// | `STUDIO_POLL_INTERVAL_MS`       | `2000`                  |
    /// | `STUDIO_EXECUTION_TIMEOUT_SECS` | unset (disabled)        |
    /// | `STUDIO_HISTORY_FILE`           | `mobile_history`        |
    /// | `STUDIO_PROMPTS_FILE`           | `mobile_prompts`        |
    /// | `STUDIO_FAVOURITES_FILE`        | `mobile_favourites`     |
    /// | `STUDIO_TEMPLATE_DIR`           | unset                   |
    pub fn from_env() -> Result<Self, StudioError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reading from `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, StudioError> {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let poll_ms: u64 = parse_number(&var, "STUDIO_POLL_INTERVAL_MS")?.unwrap_or(2000);
        if poll_ms == 0 {
            return Err(StudioError::Configuration(
                "STUDIO_POLL_INTERVAL_MS must be greater than 0".to_string(),
            ));
        }

        let execution_timeout = parse_number(&var, "STUDIO_EXECUTION_TIMEOUT_SECS")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Ok(Self {
            server_url: var("COMFYUI_SERVER").unwrap_or(defaults.server_url),
            poll_interval: Duration::from_millis(poll_ms),
            execution_timeout,
            history_file: var("STUDIO_HISTORY_FILE").unwrap_or(defaults.history_file),
            prompts_file: var("STUDIO_PROMPTS_FILE").unwrap_or(defaults.prompts_file),
            favourites_file: var("STUDIO_FAVOURITES_FILE").unwrap_or(defaults.favourites_file),
            template_dir: var("STUDIO_TEMPLATE_DIR").map(PathBuf::from),
        })
    }
}

fn parse_number(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<u64>, StudioError> {
    var(key)
        .map(|raw| {
            raw.parse::<u64>().map_err(|_| {
                StudioError::Configuration(format!("{key} must be a whole number, got {raw:?}"))
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<StudioConfig, StudioError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        StudioConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.server_url, "http://127.0.0.1:8188");
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert!(config.execution_timeout.is_none());
        assert_eq!(config.history_file, "mobile_history");
        assert!(config.template_dir.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let config = load(&[
            ("COMFYUI_SERVER", "http://gpu-box:8188"),
            ("STUDIO_POLL_INTERVAL_MS", "500"),
            ("STUDIO_EXECUTION_TIMEOUT_SECS", "600"),
            ("STUDIO_TEMPLATE_DIR", "/etc/studio/templates"),
        ])
        .unwrap();
        assert_eq!(config.server_url, "http://gpu-box:8188");
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.execution_timeout, Some(Duration::from_secs(600)));
        assert_eq!(config.template_dir, Some(PathBuf::from("/etc/studio/templates")));
    }

    #[test]
    fn zero_timeout_means_disabled() {
        let config = load(&[("STUDIO_EXECUTION_TIMEOUT_SECS", "0")]).unwrap();
        assert!(config.execution_timeout.is_none());
    }

    #[test]
    fn bad_number_is_a_configuration_error() {
        assert_matches!(
            load(&[("STUDIO_POLL_INTERVAL_MS", "fast")]),
            Err(StudioError::Configuration(msg)) if msg.contains("STUDIO_POLL_INTERVAL_MS")
        );
        assert_matches!(
            load(&[("STUDIO_POLL_INTERVAL_MS", "0")]),
            Err(StudioError::Configuration(_))
        );
    }
}
