use crate::{BroadcastId, Identifier, TrackingKey};
use rusqlite::{
    ToSql,
    types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef},
};
use tracing::error;

impl<T> ToSql for Identifier<T> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}
impl<T> FromSql for Identifier<T> {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let str = value.as_str()?;
        Identifier::new(str).map_err(|err| {
            error!(
                "Cannot convert to {} value:`{str}` - {err:?}",
                std::any::type_name::<Self>()
            );
            FromSqlError::InvalidType
        })
    }
}

impl ToSql for TrackingKey {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}
impl FromSql for TrackingKey {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let str = value.as_str()?;
        TrackingKey::from_parts(&[str]).map_err(|err| {
            error!("Cannot convert to TrackingKey value:`{str}` - {err:?}");
            FromSqlError::InvalidType
        })
    }
}

impl ToSql for BroadcastId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_string()))
    }
}
impl FromSql for BroadcastId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let str = value.as_str()?;
        str.parse::<Self>().map_err(|err| {
            error!(
                "Cannot convert to {} value:`{str}` - {err:?}",
                std::any::type_name::<Self>()
            );
            FromSqlError::InvalidType
        })
    }
}
