use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use std::fmt;

/// Location of a record inside the feed.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Position {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.topic, self.partition, self.offset)
    }
}

/// A record as read from the feed. Never mutated after it is read.
#[derive(Clone, Debug)]
pub struct Record {
    pub payload: Bytes,
    pub key: Option<String>,
    pub position: Position,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MetricRow {
    pub page_url: String,
    pub http_code: i16,
    pub response_time: i32,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not a valid metric object: {0}")]
    Json(#[from] simd_json::Error),
    #[error("page_url must not be empty")]
    EmptyUrl,
    #[error("invalid ts {0:?}: expected an ISO-8601 timestamp")]
    Timestamp(String),
}

#[derive(Debug, Deserialize)]
struct WireMetric<'a> {
    #[serde(borrow)]
    page_url: std::borrow::Cow<'a, str>,
    http_code: i16,
    response_time: i32,
    #[serde(borrow)]
    ts: std::borrow::Cow<'a, str>,
}

impl MetricRow {
    /// Projects a raw feed payload into sink columns.
    ///
    /// Every field must be present with the right type; integers must fit the
    /// `SMALLINT`/`INT` columns they land in.
    pub fn from_payload(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = payload.to_vec();
        let wire: WireMetric = simd_json::serde::from_slice(&mut buf)?;

        if wire.page_url.trim().is_empty() {
            return Err(DecodeError::EmptyUrl);
        }
        let ts = parse_timestamp(&wire.ts)?;

        Ok(Self {
            page_url: wire.page_url.into_owned(),
            http_code: wire.http_code,
            response_time: wire.response_time,
            ts,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DecodeError> {
    let trimmed = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ts.with_timezone(&Utc));
    }
    // offset-less timestamps are taken as UTC
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(DecodeError::Timestamp(raw.to_string()))
}
