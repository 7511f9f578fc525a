use std::time::Duration;

pub const DEFAULT_ROOM: &str = "global";
pub const DEFAULT_MAX_VOTES: u32 = 5;
pub const DEFAULT_TIMER_MINUTES: u32 = 5;

/// Configuration consumed by the board core
///
/// Values can come from code or from the environment (`from_env`). Numeric
/// settings are clamped to their documented minimums rather than rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardConfig {
    /// Room identifier shared by all collaborating peers.
    pub room: String,
    /// Ordered list of candidate rendezvous endpoints, highest priority first.
    pub signaling: Vec<String>,
    /// Maximum reactions a single user may hold across the board (>= 1).
    pub max_votes: u32,
    /// Whether the shared timer feature is enabled.
    pub timer_enabled: bool,
    /// Timer duration in minutes (>= 1).
    pub timer_minutes: u32,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            room: DEFAULT_ROOM.to_string(),
            signaling: Vec::new(),
            max_votes: DEFAULT_MAX_VOTES,
            timer_enabled: true,
            timer_minutes: DEFAULT_TIMER_MINUTES,
        }
    }
}

impl BoardConfig {
    /// Build a configuration from the environment, falling back to defaults.
    ///
    /// `BOARD_SIGNALING` is a comma-separated endpoint list in priority order.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let signaling = std::env::var("BOARD_SIGNALING")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or(defaults.signaling);

        Self {
            room: std::env::var("BOARD_ROOM").unwrap_or(defaults.room),
            signaling,
            max_votes: env_parse("BOARD_MAX_VOTES", defaults.max_votes).max(1),
            timer_enabled: env_parse("BOARD_TIMER_ENABLED", defaults.timer_enabled),
            timer_minutes: env_parse("BOARD_TIMER_MINUTES", defaults.timer_minutes).max(1),
        }
    }

    /// Timer duration as a `Duration`.
    pub fn timer_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.timer_minutes) * 60)
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_meet_minimums() {
        let config = BoardConfig::default();
        assert!(config.max_votes >= 1);
        assert!(config.timer_minutes >= 1);
        assert_eq!(config.room, "global");
    }

    #[test]
    fn timer_duration_converts_minutes() {
        let config = BoardConfig {
            timer_minutes: 5,
            ..Default::default()
        };
        assert_eq!(config.timer_duration(), Duration::from_secs(300));
    }
}
