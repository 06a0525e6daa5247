//! Typed identities used across the hatchery.

use crate::IdError;

// =============================================================================
// Job Identity
// =============================================================================

/// Identity of a job owned by the backend.
///
/// Job IDs are plain integers assigned by the backend. On the wire they are
/// usually JSON integers, but instance annotations may carry them as numeric
/// strings, so deserialization accepts both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(i64);

impl JobId {
    /// Creates a new JobId from an i64.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the underlying i64 value.
    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }

    /// Parses a job ID from its decimal string form.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(IdError::Empty);
        }
        trimmed
            .parse::<i64>()
            .map(Self)
            .map_err(|_| IdError::InvalidJobId(s.to_string()))
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<JobId> for i64 {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl serde::Serialize for JobId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for JobId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(serde::Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Str(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(id) => Ok(Self(id)),
            Raw::Str(s) => Self::parse(&s).map_err(serde::de::Error::custom),
        }
    }
}

// =============================================================================
// Hatchery Identity
// =============================================================================

/// Identity of one hatchery process, formatted `hatch_{ulid}`.
///
/// Used as the default hatchery name when none is configured, so that
/// annotations written by this process can be told apart from those of
/// other hatcheries sharing the same provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HatcheryId(crate::Ulid);

impl HatcheryId {
    /// The prefix for hatchery IDs.
    pub const PREFIX: &'static str = "hatch";

    /// Creates a new ID with a fresh ULID.
    #[must_use]
    pub fn new() -> Self {
        Self(crate::Ulid::new())
    }

    /// Parses an ID in the format `hatch_{ulid}`.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let Some((prefix, ulid_str)) = s.split_once('_') else {
            return Err(IdError::MissingSeparator);
        };

        if prefix != Self::PREFIX {
            return Err(IdError::InvalidPrefix {
                expected: Self::PREFIX,
                actual: prefix.to_string(),
            });
        }

        ulid_str
            .parse::<crate::Ulid>()
            .map(Self)
            .map_err(|e| IdError::InvalidUlid(e.to_string()))
    }
}

impl Default for HatcheryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for HatcheryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", Self::PREFIX, self.0)
    }
}

impl std::str::FromStr for HatcheryId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// =============================================================================
// Tests
// =============================================================================
