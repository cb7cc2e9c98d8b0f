use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Timestamp layout used on the wire and in `date` query parameters.
pub const CEL_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Direction::Incoming => "Incoming",
            Direction::Outgoing => "Outgoing",
            Direction::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// A party of a call, taken from the earliest CEL row of its channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: i64,
    pub caller_id_number: String,
    pub caller_id_name: String,
    pub context: String,
}

/// A reconstructed call, serialized in the `getCelData` row layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    #[serde(rename = "id", deserialize_with = "string_or_number")]
    pub record_key: String,
    #[serde(rename = "starttime", with = "cel_time")]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "endtime", with = "cel_time")]
    pub end_time: DateTime<Utc>,
    #[serde(rename = "duration")]
    pub duration_seconds: i64,
    #[serde(rename = "src", default)]
    pub source_number: String,
    #[serde(rename = "src_name", default)]
    pub source_name: String,
    #[serde(rename = "dst", default)]
    pub destination_number: String,
    #[serde(rename = "dst_name", default)]
    pub destination_name: String,
    pub direction: Direction,
}

/// Outcome of an `originate` command, carrying the manager's `Response` and `Message` headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginateStatus {
    pub status: String,
    #[serde(default)]
    pub message: String,
}

impl OriginateStatus {
    pub fn is_success(&self) -> bool {
        self.status == "Success"
    }
}

/// Parse a `date` parameter: either a full `YYYY-MM-DD HH:MM:SS` timestamp or a bare date.
pub fn parse_cel_time(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, CEL_TIME_FORMAT)
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc())
}

pub fn format_cel_time(time: &DateTime<Utc>) -> String {
    time.format(CEL_TIME_FORMAT).to_string()
}

// PBX modules built on PHP hand every column back as a string, ours emit strings too, but a
// numeric id is accepted for good measure.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Key {
        Text(String),
        Number(i64),
    }

    Ok(match Key::deserialize(deserializer)? {
        Key::Text(s) => s,
        Key::Number(n) => n.to_string(),
    })
}

mod cel_time {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_cel_time(time))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        super::parse_cel_time(&raw)
            .ok_or_else(|| de::Error::custom(format!("invalid CEL timestamp: {raw}")))
    }
}
