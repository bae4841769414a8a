//! Codec - store 境界での変換
//!
//! 型付きのドメイン値と SQLite の列表現を相互変換します。
//! - ID / 状態: TEXT か INTEGER
//! - タイムスタンプ: RFC 3339（UTC、ミリ秒）の TEXT。辞書順 = 時刻順
//! - lease の期限: epoch ミリ秒の INTEGER
//! - 契約 / ゲート結果 / artifact / manifest: JSON の TEXT（`Json<T>`）

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{ErrorCode, ffi};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::ids::{IdMarker, RowId};
use crate::domain::{CommitStatus, Decision, FailureClass, RunStatus, TaskId, TaskStatus};

impl ToSql for TaskId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TaskId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        String::column_result(value).map(TaskId::from)
    }
}

impl<T: IdMarker> ToSql for RowId<T> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.get()))
    }
}

impl<T: IdMarker> FromSql for RowId<T> {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(RowId::new)
    }
}

/// Text-backed enums with `as_str` / `parse`.
macro_rules! text_enum_sql {
    ($ty:ty, $what:literal) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                <$ty>::parse(text)
                    .ok_or_else(|| FromSqlError::Other(format!("unknown {}: {text}", $what).into()))
            }
        }
    };
}

text_enum_sql!(TaskStatus, "task status");
text_enum_sql!(RunStatus, "run status");
text_enum_sql!(CommitStatus, "commit status");
text_enum_sql!(Decision, "decision");
text_enum_sql!(FailureClass, "failure class");

/// RFC 3339 timestamp column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp(pub DateTime<Utc>);

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value)
    }
}

impl ToSql for Timestamp {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(encode_time(self.0)))
    }
}

impl FromSql for Timestamp {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        DateTime::parse_from_rfc3339(text)
            .map(|parsed| Timestamp(parsed.with_timezone(&Utc)))
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

pub fn encode_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Epoch-millisecond column used for lease and lock expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochMillis(pub DateTime<Utc>);

impl ToSql for EpochMillis {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.timestamp_millis()))
    }
}

impl FromSql for EpochMillis {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let millis = i64::column_result(value)?;
        DateTime::from_timestamp_millis(millis)
            .map(EpochMillis)
            .ok_or(FromSqlError::OutOfRange(millis))
    }
}

/// JSON text column holding a typed value.
#[derive(Debug, Clone, PartialEq)]
pub struct Json<T>(pub T);

impl<T: Serialize> ToSql for Json<T> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let text = serde_json::to_string(&self.0)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        Ok(ToSqlOutput::from(text))
    }
}

impl<T: DeserializeOwned> FromSql for Json<T> {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        serde_json::from_str(text)
            .map(Json)
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// PRIMARY KEY / UNIQUE constraint violation.
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => {
            failure.code == ErrorCode::ConstraintViolation
                && matches!(
                    failure.extended_code,
                    ffi::SQLITE_CONSTRAINT_PRIMARYKEY | ffi::SQLITE_CONSTRAINT_UNIQUE
                )
        }
        _ => false,
    }
}
