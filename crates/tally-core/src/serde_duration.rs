//! Serde helpers for `chrono::Duration` fields
//!
//! Durations travel as (possibly fractional) seconds: `60`, `0.5`.

use chrono::Duration;
use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let millis = duration.num_milliseconds();
    if millis % 1000 == 0 {
        serializer.serialize_i64(millis / 1000)
    } else {
        serializer.serialize_f64(millis as f64 / 1000.0)
    }
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    if !secs.is_finite() {
        return Err(serde::de::Error::custom("duration must be a finite number of seconds"));
    }
    Ok(Duration::milliseconds((secs * 1000.0).round() as i64))
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Holder {
        #[serde(with = "super")]
        d: Duration,
    }

    #[test]
    fn test_whole_and_fractional_seconds() {
        let h: Holder = serde_json::from_str(r#"{"d": 60}"#).unwrap();
        assert_eq!(h.d, Duration::seconds(60));

        let h: Holder = serde_json::from_str(r#"{"d": 0.5}"#).unwrap();
        assert_eq!(h.d, Duration::milliseconds(500));
        assert_eq!(serde_json::to_string(&h).unwrap(), r#"{"d":0.5}"#);
    }
}
