//! Application-level configuration loading: session lifecycle, clock sync and game timing.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "BUZZ_RELAY_CONFIG_PATH";

#[derive(Debug, Clone, Default)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    /// Session store settings.
    pub sessions: SessionConfig,
    /// Clock synchronization settings used by endpoints.
    pub clock_sync: ClockSyncConfig,
    /// Game timing settings used by the host runtime.
    pub game: GameConfig,
}

/// Session lifecycle settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long an unexpectedly disconnected host may reclaim its session.
    pub host_grace_period: Duration,
    /// Number of characters in generated session codes.
    pub code_length: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host_grace_period: Duration::from_secs(5 * 60),
            code_length: 6,
        }
    }
}

/// Clock synchronization tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSyncConfig {
    /// Samples retained per participant.
    pub window_size: usize,
    /// Samples required before a participant counts as synced.
    pub samples_needed: usize,
    /// Requests fired in the burst following channel-open.
    pub burst_rounds: u32,
    /// Spacing between burst requests.
    pub burst_spacing: Duration,
}

impl Default for ClockSyncConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            samples_needed: 3,
            burst_rounds: 5,
            burst_spacing: Duration::from_millis(200),
        }
    }
}

/// Game phase timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GameConfig {
    /// First value shown by the countdown.
    pub countdown_from: u32,
    /// Delay between countdown ticks.
    pub countdown_tick: Duration,
    /// How long the buzz window stays open before the result is forced.
    pub buzz_window: Duration,
    /// Participants needed to start a game.
    pub min_participants: usize,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            countdown_from: 3,
            countdown_tick: Duration::from_secs(1),
            buzz_window: Duration::from_secs(10),
            min_participants: 2,
        }
    }
}

impl AppConfig {
    /// Load the application configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => Self::from_json_str(&contents).unwrap_or_else(|err| {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to parse config; falling back to defaults"
                );
                Self::default()
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Parse a JSON document; absent keys keep their defaults.
    pub fn from_json_str(contents: &str) -> serde_json::Result<Self> {
        let raw = serde_json::from_str::<RawConfig>(contents)?;
        let config: Self = raw.into();
        info!(
            grace_secs = config.sessions.host_grace_period.as_secs(),
            countdown_from = config.game.countdown_from,
            "loaded configuration"
        );
        Ok(config)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    host_grace_period_secs: Option<u64>,
    session_code_length: Option<usize>,
    clock_sync: RawClockSync,
    game: RawGame,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawClockSync {
    window_size: Option<usize>,
    samples_needed: Option<usize>,
    burst_rounds: Option<u32>,
    burst_spacing_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawGame {
    countdown_from: Option<u32>,
    countdown_tick_ms: Option<u64>,
    buzz_window_ms: Option<u64>,
    min_participants: Option<usize>,
}

impl From<RawConfig> for AppConfig {
    fn from(value: RawConfig) -> Self {
        let sessions = SessionConfig::default();
        let clock_sync = ClockSyncConfig::default();
        let game = GameConfig::default();
        let window_size = value
            .clock_sync
            .window_size
            .unwrap_or(clock_sync.window_size)
            .max(1);

        Self {
            sessions: SessionConfig {
                host_grace_period: value
                    .host_grace_period_secs
                    .map(Duration::from_secs)
                    .unwrap_or(sessions.host_grace_period),
                code_length: value
                    .session_code_length
                    .unwrap_or(sessions.code_length)
                    .clamp(4, 12),
            },
            clock_sync: ClockSyncConfig {
                window_size,
                samples_needed: value
                    .clock_sync
                    .samples_needed
                    .unwrap_or(clock_sync.samples_needed)
                    .clamp(1, window_size),
                burst_rounds: value
                    .clock_sync
                    .burst_rounds
                    .unwrap_or(clock_sync.burst_rounds),
                burst_spacing: value
                    .clock_sync
                    .burst_spacing_ms
                    .map(Duration::from_millis)
                    .unwrap_or(clock_sync.burst_spacing),
            },
            game: GameConfig {
                countdown_from: value.game.countdown_from.unwrap_or(game.countdown_from),
                countdown_tick: value
                    .game
                    .countdown_tick_ms
                    .map(Duration::from_millis)
                    .unwrap_or(game.countdown_tick),
                buzz_window: value
                    .game
                    .buzz_window_ms
                    .map(Duration::from_millis)
                    .unwrap_or(game.buzz_window),
                min_participants: value
                    .game
                    .min_participants
                    .unwrap_or(game.min_participants)
                    .max(1),
            },
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
