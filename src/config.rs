use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::brain::BrainSettings;
use crate::hands::{ChromeSettings, InteractionSettings};
use crate::orchestrator::LoopSettings;

/// Runtime configuration. Every flag can also come from the environment
/// (or a `.env` file loaded before parsing).
#[derive(Debug, Clone, Parser)]
#[command(name = "agent", version, about = "Natural-language browser automation agent")]
pub struct Config {
    #[arg(long, env = "PILOT_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// First port to try; the next few are used if it is taken.
    #[arg(long, env = "PILOT_PORT", default_value_t = 8000)]
    pub port: u16,

    #[arg(long, env = "PILOT_REPORTS_DIR", default_value = "reports")]
    pub reports_dir: PathBuf,

    /// Public URL under which the reports directory is served.
    #[arg(
        long,
        env = "PILOT_REPORT_BASE_URL",
        default_value = "http://localhost:8000/reports_files"
    )]
    pub report_base_url: String,

    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub api_base_url: String,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: String,

    #[arg(long, env = "PILOT_STANDARD_MODEL", default_value = "gpt-4o-mini")]
    pub standard_model: String,

    /// Used on the first cycle and after a failed one.
    #[arg(long, env = "PILOT_ESCALATED_MODEL", default_value = "gpt-4o")]
    pub escalated_model: String,

    #[arg(long, env = "PILOT_TEMPERATURE", default_value_t = 0.2)]
    pub temperature: f32,

    #[arg(long, env = "PILOT_DECISION_TIMEOUT_SECS", default_value_t = 120)]
    pub decision_timeout_secs: u64,

    #[arg(long, env = "PILOT_IDLE_TIMEOUT_MS", default_value_t = 5000)]
    pub idle_timeout_ms: u64,

    #[arg(long, env = "PILOT_LOCATOR_TIMEOUT_MS", default_value_t = 5000)]
    pub locator_timeout_ms: u64,

    #[arg(long, env = "PILOT_NAVIGATION_TIMEOUT_MS", default_value_t = 30000)]
    pub navigation_timeout_ms: u64,

    #[arg(long, env = "PILOT_ACTION_BACKOFF_MS", default_value_t = 1000)]
    pub action_backoff_ms: u64,

    /// DevTools websocket URL of a running Chrome to attach to.
    #[arg(long, env = "PILOT_CHROME_URL")]
    pub chrome_url: Option<String>,

    #[arg(long, env = "PILOT_CHROME_PATH")]
    pub chrome_path: Option<PathBuf>,

    #[arg(long, env = "PILOT_HEADLESS", default_value_t = false)]
    pub headless: bool,

    /// Defaults to a directory under the platform cache dir.
    #[arg(long, env = "PILOT_PROFILE_DIR")]
    pub profile_dir: Option<PathBuf>,
}

impl Config {
    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            decision_timeout: Duration::from_secs(self.decision_timeout_secs),
            action_backoff: Duration::from_millis(self.action_backoff_ms),
        }
    }

    pub fn interaction_settings(&self) -> InteractionSettings {
        InteractionSettings {
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            locator_timeout: Duration::from_millis(self.locator_timeout_ms),
            navigation_timeout: Duration::from_millis(self.navigation_timeout_ms),
            ..InteractionSettings::default()
        }
    }

    pub fn brain_settings(&self) -> BrainSettings {
        BrainSettings {
            base_url: self.api_base_url.clone(),
            api_key: self.api_key.clone(),
            standard_model: self.standard_model.clone(),
            escalated_model: self.escalated_model.clone(),
            temperature: self.temperature,
        }
    }

    pub fn chrome_settings(&self) -> ChromeSettings {
        ChromeSettings {
            attach_url: self.chrome_url.clone(),
            executable: self.chrome_path.clone(),
            profile_dir: self.profile_dir.clone(),
            headless: self.headless,
            ..ChromeSettings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_onto_runtime_settings() {
        let config = Config::try_parse_from([
            "agent",
            "--api-key",
            "sk-test",
            "--port",
            "9000",
            "--action-backoff-ms",
            "250",
            "--locator-timeout-ms",
            "1500",
            "--headless",
        ])
        .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.loop_settings().action_backoff, Duration::from_millis(250));
        let interaction = config.interaction_settings();
        assert_eq!(interaction.locator_timeout, Duration::from_millis(1500));
        assert_eq!(interaction.pointer_steps, 10);
        assert!(config.chrome_settings().headless);
        assert_eq!(config.brain_settings().api_key, "sk-test");
    }
}
