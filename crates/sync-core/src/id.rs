use std::{
    fmt,
    str::FromStr,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Milliseconds between the Unix epoch and the id epoch (2015-01-01T00:00:00Z).
pub const ID_EPOCH_MS: u64 = 1_420_070_400_000;

const TIMESTAMP_SHIFT: u32 = 22;
const WORKER_SHIFT: u32 = 12;
const WORKER_MASK: u64 = 0x3FF;
const SEQUENCE_MASK: u64 = 0xFFF;

/// Time-sortable 64-bit identifier ("snowflake").
///
/// The upper 42 bits hold milliseconds since [`ID_EPOCH_MS`], so comparing two
/// ids compares their creation time first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderedId(u64);

impl OrderedId {
    /// Id carried by optimistic messages the server has not confirmed yet.
    pub const PLACEHOLDER: Self = Self(0);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_placeholder(self) -> bool {
        self.0 == 0
    }

    /// Creation time in milliseconds since the Unix epoch.
    pub const fn timestamp_ms(self) -> u64 {
        (self.0 >> TIMESTAMP_SHIFT) + ID_EPOCH_MS
    }

    /// Smallest id that could have been created at `unix_ms`.
    ///
    /// Useful as a `before`/`after` cursor when only a wall-clock time is known.
    pub const fn from_timestamp_ms(unix_ms: u64) -> Self {
        Self(unix_ms.saturating_sub(ID_EPOCH_MS) << TIMESTAMP_SHIFT)
    }

    pub const fn worker(self) -> u16 {
        ((self.0 >> WORKER_SHIFT) & WORKER_MASK) as u16
    }

    pub const fn sequence(self) -> u16 {
        (self.0 & SEQUENCE_MASK) as u16
    }
}

impl From<u64> for OrderedId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for OrderedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OrderedId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(Self)
    }
}

// Wire ids are decimal strings so that 64-bit values survive JSON number parsing
// on every peer. Plain numbers are still accepted on input.
impl Serialize for OrderedId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for OrderedId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(u64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(raw) => Ok(Self(raw)),
            Repr::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[derive(Debug, Default)]
struct GeneratorState {
    last_ms: u64,
    sequence: u64,
}

/// Produces strictly increasing ids for locally created entities.
#[derive(Debug)]
pub struct OrderedIdGenerator {
    worker: u64,
    state: Mutex<GeneratorState>,
}

impl OrderedIdGenerator {
    pub fn new(worker: u16) -> Self {
        Self {
            worker: u64::from(worker) & WORKER_MASK,
            state: Mutex::new(GeneratorState::default()),
        }
    }

    /// Next id stamped with the current wall clock.
    pub fn next_id(&self) -> OrderedId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(ID_EPOCH_MS);
        self.next_id_at(now)
    }

    /// Next id for a caller-supplied clock reading.
    ///
    /// A clock that goes backwards is clamped to the last issued millisecond.
    pub fn next_id_at(&self, unix_ms: u64) -> OrderedId {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let elapsed = unix_ms.saturating_sub(ID_EPOCH_MS).max(state.last_ms);
        if elapsed == state.last_ms {
            state.sequence += 1;
            if state.sequence > SEQUENCE_MASK {
                state.last_ms += 1;
                state.sequence = 0;
            }
        } else {
            state.last_ms = elapsed;
            state.sequence = 0;
        }

        OrderedId(
            (state.last_ms << TIMESTAMP_SHIFT) | (self.worker << WORKER_SHIFT) | state.sequence,
        )
    }
}

impl Default for OrderedIdGenerator {
    fn default() -> Self {
        Self::new(0)
    }
}
