//! Row types for the client record table.

use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use diesel::sql_types::{BigInt, Nullable, Text};

use super::tables::ClientColumn;
use crate::store::{ClientRecord, ClientValue, StoreError, StoreResult, MAX_TIMESTAMP_YEAR};

/// Client record row as read from the database.
///
/// Field names match the storage column names.
#[derive(diesel::QueryableByName, Debug, Clone)]
pub struct ClientRecordRow {
    #[diesel(sql_type = Text)]
    pub id: String,
    #[diesel(sql_type = BigInt)]
    pub count: i64,
    #[diesel(sql_type = Text)]
    pub first_request: String,
    #[diesel(sql_type = Text)]
    pub last_request: String,
    #[diesel(sql_type = Nullable<Text>)]
    pub expires: Option<String>,
}

/// Client record row ready for binding into INSERT/UPDATE statements.
#[derive(Debug, Clone)]
pub struct NewClientRecord<'a> {
    pub id: &'a str,
    pub count: i64,
    pub first_request: String,
    pub last_request: String,
    pub expires: Option<String>,
}

impl<'a> NewClientRecord<'a> {
    pub fn new(
        id: &'a str,
        value: &ClientValue,
        expires: Option<DateTime<Utc>>,
    ) -> StoreResult<Self> {
        let count = i64::try_from(value.count).map_err(|_| {
            StoreError::Mapping(format!(
                "{} out of range: {}",
                ClientColumn::Count.public_name(),
                value.count
            ))
        })?;

        Ok(Self {
            id,
            count,
            first_request: storable_timestamp(ClientColumn::FirstRequest, value.first_request)?,
            last_request: storable_timestamp(ClientColumn::LastRequest, value.last_request)?,
            expires: expires
                .map(|dt| storable_timestamp(ClientColumn::Expires, dt))
                .transpose()?,
        })
    }
}

/// Format a timestamp for storage.
///
/// Fixed-width UTC with microseconds, so text comparison orders chronologically.
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Format a timestamp for storage, rejecting years outside `0..=9999`.
///
/// Other years render with a sign and more digits, which neither parses back
/// nor sorts correctly as text.
fn storable_timestamp(column: ClientColumn, dt: DateTime<Utc>) -> StoreResult<String> {
    if !(0..=MAX_TIMESTAMP_YEAR).contains(&dt.year()) {
        return Err(StoreError::Mapping(format!(
            "{} out of range: {}",
            column.public_name(),
            dt
        )));
    }
    Ok(format_timestamp(dt))
}

/// Parse a stored timestamp, naming the column on failure.
fn parse_timestamp(column: ClientColumn, s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            StoreError::Mapping(format!(
                "Invalid {} ({}): '{}': {}",
                column.storage_name(),
                column.public_name(),
                s,
                e
            ))
        })
}

/// Convert a database row to the public record shape.
impl TryFrom<ClientRecordRow> for ClientRecord {
    type Error = StoreError;

    fn try_from(row: ClientRecordRow) -> Result<Self, Self::Error> {
        let count = u64::try_from(row.count).map_err(|_| {
            StoreError::Mapping(format!(
                "Negative {} for '{}': {}",
                ClientColumn::Count.storage_name(),
                row.id,
                row.count
            ))
        })?;

        Ok(ClientRecord {
            count,
            first_request: parse_timestamp(ClientColumn::FirstRequest, &row.first_request)?,
            last_request: parse_timestamp(ClientColumn::LastRequest, &row.last_request)?,
            expires: row
                .expires
                .as_deref()
                .map(|s| parse_timestamp(ClientColumn::Expires, s))
                .transpose()?,
            id: row.id,
        })
    }
}
