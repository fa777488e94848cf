use serde_json::Value as JsonValue;

use crate::functions::{timestamp, uuid_v7, FunctionProvider};

pub const DETERMINISTIC_MODE_KEY: &str = "lix_deterministic_mode";
pub const SEQUENCE_KEY: &str = "lix_deterministic_sequence_number";

const UUID_COUNTER_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeterministicSettings {
    pub enabled: bool,
    pub seed: u64,
}

impl DeterministicSettings {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            seed: 0,
        }
    }

    /// Parses the `lix_deterministic_mode` key-value payload, e.g.
    /// `{"enabled": true, "seed": 7}`.
    pub fn from_payload(payload: &JsonValue) -> Self {
        let enabled = payload
            .get("enabled")
            .map(json_truthy)
            .unwrap_or(false);
        if !enabled {
            return Self::disabled();
        }
        let seed = payload
            .get("seed")
            .and_then(|value| match value {
                JsonValue::Number(number) => number.as_u64(),
                JsonValue::String(text) => text.parse::<u64>().ok(),
                _ => None,
            })
            .unwrap_or(0);
        Self { enabled, seed }
    }
}

fn json_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Bool(flag) => *flag,
        JsonValue::Number(number) => number.as_i64().map(|n| n != 0).unwrap_or(false),
        JsonValue::String(text) => text == "true" || text == "1",
        _ => false,
    }
}

/// Function provider honoring deterministic mode: seeded v7-shaped UUIDs and
/// epoch-based millisecond timestamps, both driven by one shared sequence so
/// replays interleave identically.
#[derive(Debug, Clone)]
pub struct RuntimeFunctionProvider {
    settings: DeterministicSettings,
    next_sequence: i64,
}

impl RuntimeFunctionProvider {
    pub fn new(settings: DeterministicSettings, next_sequence: i64) -> Self {
        Self {
            settings,
            next_sequence,
        }
    }

    pub fn next_sequence(&self) -> i64 {
        self.next_sequence
    }

    fn take_sequence(&mut self) -> i64 {
        let current = self.next_sequence;
        self.next_sequence += 1;
        current
    }
}

impl crate::functions::SharedFunctionProvider<RuntimeFunctionProvider> {
    /// Current sequence position, persisted at commit boundaries so a
    /// reopened engine continues where the last one stopped.
    pub fn sequence_snapshot(&self) -> i64 {
        self.with_inner(|provider| provider.next_sequence())
    }
}

impl FunctionProvider for RuntimeFunctionProvider {
    fn uuid_v7(&mut self) -> String {
        if self.settings.enabled {
            let counter = (self.take_sequence() as u64) & UUID_COUNTER_MASK;
            let seed_bits = self.settings.seed & 0xFFFF;
            return format!("01920000-{seed_bits:04x}-7000-8000-{counter:012x}");
        }
        uuid_v7()
    }

    fn timestamp(&mut self) -> String {
        if self.settings.enabled {
            let millis = self.take_sequence();
            let dt = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(millis)
                .unwrap_or(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH);
            return dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        }
        timestamp()
    }
}

#[cfg(test)]
mod tests {
    use super::{DeterministicSettings, RuntimeFunctionProvider};
    use crate::functions::FunctionProvider;
    use serde_json::json;

    #[test]
    fn parses_enabled_payload_with_seed() {
        let settings = DeterministicSettings::from_payload(&json!({"enabled": true, "seed": 42}));
        assert!(settings.enabled);
        assert_eq!(settings.seed, 42);
    }

    #[test]
    fn disabled_payload_ignores_seed() {
        let settings = DeterministicSettings::from_payload(&json!({"enabled": false, "seed": 42}));
        assert_eq!(settings, DeterministicSettings::disabled());
    }

    #[test]
    fn seeded_sequences_are_reproducible() {
        let settings = DeterministicSettings { enabled: true, seed: 7 };
        let mut first = RuntimeFunctionProvider::new(settings, 0);
        let mut second = RuntimeFunctionProvider::new(settings, 0);

        for _ in 0..4 {
            assert_eq!(first.uuid_v7(), second.uuid_v7());
            assert_eq!(first.timestamp(), second.timestamp());
        }
    }

    #[test]
    fn seed_changes_uuid_sequence() {
        let mut a = RuntimeFunctionProvider::new(
            DeterministicSettings { enabled: true, seed: 1 },
            0,
        );
        let mut b = RuntimeFunctionProvider::new(
            DeterministicSettings { enabled: true, seed: 2 },
            0,
        );
        assert_ne!(a.uuid_v7(), b.uuid_v7());
    }

    #[test]
    fn deterministic_timestamps_start_at_epoch() {
        let mut provider = RuntimeFunctionProvider::new(
            DeterministicSettings { enabled: true, seed: 0 },
            0,
        );
        assert_eq!(provider.timestamp(), "1970-01-01T00:00:00.000Z");
        assert_eq!(provider.timestamp(), "1970-01-01T00:00:00.001Z");
    }
}
