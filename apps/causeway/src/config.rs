use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use negotiation_webrtc::IceServer;

use crate::monitor::LivenessConfig;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// What happens when an offer arrives while a negotiation already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OfferPolicy {
    #[default]
    Reject,
    Replace,
}

impl FromStr for OfferPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(OfferPolicy::Reject),
            "replace" => Ok(OfferPolicy::Replace),
            other => Err(format!("unknown offer policy: {other}")),
        }
    }
}

/// How the answer is delivered: streamed candidates, or one answer sent
/// after gathering has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnswerPolicy {
    #[default]
    Trickle,
    Vanilla,
}

impl FromStr for AnswerPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "trickle" => Ok(AnswerPolicy::Trickle),
            "vanilla" => Ok(AnswerPolicy::Vanilla),
            other => Err(format!("unknown answer policy: {other}")),
        }
    }
}

/// What a failed negotiation attempt does to the session that carried it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    #[default]
    KeepOpen,
    CloseSession,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "keep-open" | "keep_open" => Ok(FailurePolicy::KeepOpen),
            "close-session" | "close_session" => Ok(FailurePolicy::CloseSession),
            other => Err(format!("unknown failure policy: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub static_dir: Option<PathBuf>,
    pub ice_servers: Vec<IceServer>,
    pub offer_policy: OfferPolicy,
    pub answer_policy: AnswerPolicy,
    pub failure_policy: FailurePolicy,
    pub liveness: LivenessConfig,
    pub data_channel_echo: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            static_dir: None,
            ice_servers: vec![IceServer {
                urls: vec![DEFAULT_STUN_URL.to_string()],
                username: None,
                credential: None,
            }],
            offer_policy: OfferPolicy::default(),
            answer_policy: AnswerPolicy::default(),
            failure_policy: FailurePolicy::default(),
            liveness: LivenessConfig::default(),
            data_channel_echo: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env::var("CAUSEWAY_PORT")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.port),
            static_dir: env::var("CAUSEWAY_STATIC_DIR")
                .ok()
                .filter(|dir| !dir.trim().is_empty())
                .map(PathBuf::from),
            ice_servers: ice_servers_from_env(),
            offer_policy: parsed_from_env("CAUSEWAY_OFFER_POLICY", defaults.offer_policy),
            answer_policy: parsed_from_env("CAUSEWAY_ANSWER_POLICY", defaults.answer_policy),
            failure_policy: parsed_from_env("CAUSEWAY_FAILURE_POLICY", defaults.failure_policy),
            liveness: LivenessConfig {
                probe_interval: secs_from_env(
                    "CAUSEWAY_PROBE_INTERVAL_SECS",
                    defaults.liveness.probe_interval,
                ),
                idle_timeout: secs_from_env(
                    "CAUSEWAY_IDLE_TIMEOUT_SECS",
                    defaults.liveness.idle_timeout,
                ),
            },
            data_channel_echo: env::var("CAUSEWAY_DATA_CHANNEL_ECHO")
                .map(|raw| truthy(&raw))
                .unwrap_or(defaults.data_channel_echo),
        }
    }
}

fn parsed_from_env<P: FromStr>(key: &str, fallback: P) -> P {
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(fallback)
}

fn secs_from_env(key: &str, fallback: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(fallback)
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn ice_servers_from_env() -> Vec<IceServer> {
    let mut servers = Vec::new();

    let stun_raw = env::var("CAUSEWAY_STUN_URLS").unwrap_or_else(|_| DEFAULT_STUN_URL.to_string());
    let stun_urls = split_urls(&stun_raw);
    if !stun_urls.is_empty() {
        servers.push(IceServer {
            urls: stun_urls,
            username: None,
            credential: None,
        });
    }

    if let Ok(turn_url) = env::var("CAUSEWAY_TURN_URL") {
        let turn_url = turn_url.trim();
        if !turn_url.is_empty() {
            servers.push(IceServer {
                urls: vec![turn_url.to_string()],
                username: env::var("CAUSEWAY_TURN_USERNAME")
                    .ok()
                    .filter(|value| !value.is_empty()),
                credential: env::var("CAUSEWAY_TURN_CREDENTIAL")
                    .ok()
                    .filter(|value| !value.is_empty()),
            });
        }
    }

    servers
}

fn split_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls, vec![DEFAULT_STUN_URL]);
        assert_eq!(config.offer_policy, OfferPolicy::Reject);
        assert_eq!(config.answer_policy, AnswerPolicy::Trickle);
        assert_eq!(config.failure_policy, FailurePolicy::KeepOpen);
        assert_eq!(config.liveness.probe_interval, Duration::from_secs(30));
        assert_eq!(config.liveness.idle_timeout, Duration::from_secs(45));
        assert!(!config.data_channel_echo);
    }

    #[test_timeout::timeout]
    fn policies_parse_case_insensitively() {
        assert_eq!("REPLACE".parse::<OfferPolicy>(), Ok(OfferPolicy::Replace));
        assert_eq!(" reject ".parse::<OfferPolicy>(), Ok(OfferPolicy::Reject));
        assert!("renegotiate".parse::<OfferPolicy>().is_err());

        assert_eq!("vanilla".parse::<AnswerPolicy>(), Ok(AnswerPolicy::Vanilla));
        assert_eq!("Trickle".parse::<AnswerPolicy>(), Ok(AnswerPolicy::Trickle));
        assert!("".parse::<AnswerPolicy>().is_err());

        assert_eq!(
            "close-session".parse::<FailurePolicy>(),
            Ok(FailurePolicy::CloseSession)
        );
        assert_eq!(
            "keep_open".parse::<FailurePolicy>(),
            Ok(FailurePolicy::KeepOpen)
        );
        assert!("shrug".parse::<FailurePolicy>().is_err());
    }

    #[test_timeout::timeout]
    fn truthy_accepts_common_spellings() {
        for value in ["1", "true", "TRUE", "yes", " on "] {
            assert!(truthy(value), "{value:?} should be truthy");
        }
        for value in ["0", "false", "no", "off", ""] {
            assert!(!truthy(value), "{value:?} should be falsy");
        }
    }

    #[test_timeout::timeout]
    fn url_lists_are_split_and_trimmed() {
        assert_eq!(
            split_urls("stun:a.example.net, stun:b.example.net ,"),
            vec!["stun:a.example.net".to_string(), "stun:b.example.net".to_string()]
        );
        assert!(split_urls("  ,, ").is_empty());
    }
}
