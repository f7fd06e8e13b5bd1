//! Keyset cursor over `(timestamp, id)` for hot read paths.
//!
//! The encoded form is `<rfc3339-millis>_<row-id>`. Pages are ordered by
//! `(ts, id)` descending and the cursor names the last row already returned,
//! so concurrent inserts can neither duplicate nor skip rows that a client
//! has seen.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_LIMIT: i64 = 50;
pub const MAX_PAGE_LIMIT: i64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor {
    pub ts: DateTime<Utc>,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorError {
    pub message: String,
}

impl std::fmt::Display for CursorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid cursor: {}", self.message)
    }
}

impl std::error::Error for CursorError {}

impl PageCursor {
    pub fn new(ts: DateTime<Utc>, id: impl Into<String>) -> Self {
        Self { ts, id: id.into() }
    }

    pub fn encode(&self) -> String {
        format!(
            "{}_{}",
            self.ts.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.id
        )
    }

    /// The timestamp half is RFC 3339 and cannot contain an underscore, so
    /// the first underscore always separates the two halves.
    pub fn decode(raw: &str) -> Result<Self, CursorError> {
        let (ts_part, id_part) = raw.split_once('_').ok_or_else(|| CursorError {
            message: "expected <timestamp>_<id>".to_string(),
        })?;

        if id_part.is_empty() {
            return Err(CursorError {
                message: "empty row id".to_string(),
            });
        }

        let ts = DateTime::parse_from_rfc3339(ts_part)
            .map_err(|_| CursorError {
                message: "timestamp half is not RFC 3339".to_string(),
            })?
            .with_timezone(&Utc);

        Ok(Self {
            ts,
            id: id_part.to_string(),
        })
    }
}

/// Page envelope returned by keyset read handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

impl<T> Page<T> {
    /// Build a page from a `limit + 1` over-fetch. The extra row (if any) is
    /// dropped; its predecessor becomes the next cursor.
    pub fn from_overfetch(
        mut rows: Vec<T>,
        limit: usize,
        cursor_of: impl Fn(&T) -> PageCursor,
    ) -> Self {
        let has_more = rows.len() > limit;
        if has_more {
            rows.truncate(limit);
        }
        let next_cursor = if has_more {
            rows.last().map(|row| cursor_of(row).encode())
        } else {
            None
        };
        Self {
            items: rows,
            next_cursor,
            has_more,
        }
    }
}

pub fn clamp_limit(requested: Option<i64>) -> i64 {
    requested
        .unwrap_or(DEFAULT_PAGE_LIMIT)
        .clamp(1, MAX_PAGE_LIMIT)
}
