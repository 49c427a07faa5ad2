use std::{cmp::Ordering, fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use typed_builder::TypedBuilder;

use crate::error::StageIdError;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * 1024;

/// Separates the stage id from the other dimensions of a tag key.
pub const TAG_SEPARATOR: char = ':';

/// Opaque stage identifier, stable for the whole test.
///
/// The id is embedded verbatim at the front of every tag key, so it can never
/// contain [`TAG_SEPARATOR`]. That keeps the id recorded with a sample and the
/// id parsed back during aggregation identical.
///
/// Ids that look like unsigned integers sort numerically, so `"2"` comes
/// before `"10"`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StageId(String);

impl StageId {
    pub fn new(id: impl Into<String>) -> Result<Self, StageIdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(StageIdError::Empty);
        }
        if id.contains(TAG_SEPARATOR) {
            return Err(StageIdError::ContainsSeparator(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn numeric(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl Ord for StageId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for StageId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for StageId {
    type Err = StageIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl From<u32> for StageId {
    fn from(value: u32) -> Self {
        Self(value.to_string())
    }
}

impl Serialize for StageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for StageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Config files may spell ids either as `id = 1` or `id = "warmup"`.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        let id = match Raw::deserialize(deserializer)? {
            Raw::Number(n) => n.to_string(),
            Raw::Text(s) => s,
        };
        StageId::new(id).map_err(serde::de::Error::custom)
    }
}

/// One phase of the load test.
///
/// A stage starts `start_offset` after the test begins, runs `vus` virtual
/// users concurrently and each of them performs `iterations` measurement runs
/// capped at `bandwidth_limit` bytes per second.
///
/// ```
/// use std::time::Duration;
/// use trickle::stage::{Stage, StageId, KIB};
///
/// let stage = Stage::builder()
///     .id(StageId::from(1))
///     .name("Stage 1: 500 KB/s")
///     .bandwidth_limit(500 * KIB)
///     .start_offset(Duration::from_secs(30))
///     .build();
/// assert_eq!(stage.vus, 1);
/// ```
#[derive(Clone, Debug, PartialEq, TypedBuilder, Serialize, Deserialize)]
pub struct Stage {
    pub id: StageId,
    #[builder(setter(into))]
    pub name: String,
    /// Bytes per second.
    pub bandwidth_limit: u64,
    #[builder(default)]
    #[serde(default, rename = "start_offset_secs", with = "secs")]
    pub start_offset: Duration,
    #[builder(default = 1)]
    #[serde(default = "one")]
    pub vus: usize,
    #[builder(default = 1)]
    #[serde(default = "one")]
    pub iterations: usize,
    /// Overrides the harness-wide target address for this stage.
    #[builder(default, setter(strip_option, into))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

fn one() -> usize {
    1
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_separator_and_empty_ids() {
        assert_eq!(StageId::new(""), Err(StageIdError::Empty));
        assert_eq!(
            StageId::new("1:fast"),
            Err(StageIdError::ContainsSeparator("1:fast".into()))
        );
        assert!(StageId::new("warmup").is_ok());
    }

    #[test]
    fn numeric_ids_sort_numerically() {
        let mut ids: Vec<StageId> = ["10", "b", "2", "a", "1"]
            .into_iter()
            .map(|s| s.parse().unwrap())
            .collect();
        ids.sort();
        let ids: Vec<&str> = ids.iter().map(StageId::as_str).collect();
        assert_eq!(ids, ["1", "2", "10", "a", "b"]);
    }

    #[test]
    fn leading_zeros_stay_distinct() {
        let a: StageId = "01".parse().unwrap();
        let b: StageId = "1".parse().unwrap();
        assert_ne!(a, b);
        assert_ne!(a.cmp(&b), Ordering::Equal);
    }

    #[test]
    fn deserializes_numbers_and_strings() {
        #[derive(Deserialize)]
        struct Wrapper {
            id: StageId,
        }

        let n: Wrapper = toml::from_str("id = 3").unwrap();
        let s: Wrapper = toml::from_str("id = \"warmup\"").unwrap();
        assert_eq!(n.id.as_str(), "3");
        assert_eq!(s.id.as_str(), "warmup");
        assert!(toml::from_str::<Wrapper>("id = \"a:b\"").is_err());
    }

    #[test]
    fn stage_from_toml_uses_defaults() {
        let stage: Stage = toml::from_str(
            r#"
            id = 2
            name = "Stage 2: 1 MB/s"
            bandwidth_limit = 1048576
            start_offset_secs = 1.5
            "#,
        )
        .unwrap();

        assert_eq!(stage.id, StageId::from(2));
        assert_eq!(stage.bandwidth_limit, MIB);
        assert_eq!(stage.start_offset, Duration::from_millis(1500));
        assert_eq!(stage.vus, 1);
        assert_eq!(stage.iterations, 1);
        assert_eq!(stage.address, None);
    }
}
