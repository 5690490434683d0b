use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::ops::Add;
use std::time::SystemTime;

/// A millisecond-resolution Unix timestamp.
///
/// Authorization creation and expiry times, batch timestamps, and dispute
/// timestamps all use millisecond epoch values, so this type wraps a `u64`
/// of milliseconds since 1970-01-01T00:00:00Z.
///
/// Serialized as a plain JSON integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnixMillis(u64);

impl UnixMillis {
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("SystemTime before UNIX epoch?!?")
            .as_millis() as u64;
        Self(now)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn as_secs(&self) -> u64 {
        self.0 / 1000
    }

    /// Milliseconds elapsed since `earlier`, saturating at zero.
    pub fn millis_since(&self, earlier: UnixMillis) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    /// Whole seconds elapsed since `earlier`, saturating at zero.
    pub fn secs_since(&self, earlier: UnixMillis) -> u64 {
        self.millis_since(earlier) / 1000
    }
}

impl Serialize for UnixMillis {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for UnixMillis {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(UnixMillis(millis))
    }
}

impl Display for UnixMillis {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<u64> for UnixMillis {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        UnixMillis(self.0 + rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_integer() {
        let ts = UnixMillis::from_millis(1_700_000_000_000);
        assert_eq!(serde_json::to_string(&ts).unwrap(), "1700000000000");
        let back: UnixMillis = serde_json::from_str("1700000000000").unwrap();
        assert_eq!(back, ts);
    }

    #[test]
    fn elapsed_saturates() {
        let earlier = UnixMillis::from_millis(5_000);
        let later = UnixMillis::from_millis(11_000);
        assert_eq!(later.millis_since(earlier), 6_000);
        assert_eq!(later.secs_since(earlier), 6);
        assert_eq!(earlier.millis_since(later), 0);
    }

    #[test]
    fn now_is_after_2023() {
        assert!(UnixMillis::now().as_millis() > 1_700_000_000_000);
    }
}
