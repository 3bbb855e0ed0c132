//! UTC timestamps in the gateway's `yyyy-MM-ddTHH:mm:ssZ` form.
//!
//! Every request header and every time-range bound travels in this format.
//! The serde helpers below let protocol structs carry `DateTime<Utc>` while
//! serializing to the gateway's textual form.

use crate::ProtocolError;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// strftime pattern for gateway timestamps
pub const UTC_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Render a timestamp in gateway form
pub fn format(time: &DateTime<Utc>) -> String {
    time.format(UTC_FORMAT).to_string()
}

/// Parse a gateway timestamp
pub fn parse(text: &str) -> Result<DateTime<Utc>, ProtocolError> {
    NaiveDateTime::parse_from_str(text.trim(), UTC_FORMAT)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|_| ProtocolError::Timestamp(text.to_string()))
}

/// Truncate to whole seconds, the resolution the gateway works in
pub fn to_seconds(time: &DateTime<Utc>) -> i64 {
    time.timestamp()
}

/// Serde adapter for `DateTime<Utc>` fields
pub mod utc {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize in gateway form
    pub fn serialize<S: Serializer>(time: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format(time))
    }

    /// Deserialize from gateway form
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(d)?;
        super::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for `Option<DateTime<Utc>>` fields
pub mod utc_option {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize in gateway form, `None` as null
    pub fn serialize<S: Serializer>(
        time: &Option<DateTime<Utc>>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match time {
            Some(time) => s.serialize_some(&super::format(time)),
            None => s.serialize_none(),
        }
    }

    /// Deserialize from gateway form, accepting null
    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(text) => super::parse(&text)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_uses_gateway_layout() {
        let time = Utc.with_ymd_and_hms(2024, 1, 1, 3, 0, 0).unwrap();
        assert_eq!(format(&time), "2024-01-01T03:00:00Z");
    }

    #[test]
    fn test_parse_rejects_other_layouts() {
        assert!(parse("2024-01-01T03:00:00Z").is_ok());
        assert_eq!(
            parse("2024/01/01 03:00"),
            Err(ProtocolError::Timestamp("2024/01/01 03:00".to_string()))
        );
    }
}
