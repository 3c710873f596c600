// ABOUTME: Converts source column values into typed PostgreSQL parameters
// ABOUTME: Target type is chosen from the replica column's information_schema data_type

use anyhow::{anyhow, bail, Context, Result};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use std::str::FromStr;
use tokio_postgres::types::ToSql;

use crate::model::ColumnValue;

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Boxed parameter accepted by `Client::execute` and friends.
pub type SqlParam = Box<dyn ToSql + Sync + Send>;

/// Convert a value for binding to a replica column of type `data_type`.
///
/// NULL binds as a typed `None` for every supported type. Values that cannot
/// be represented in the replica column are errors rather than silent
/// truncations.
pub fn to_sql_param(value: &ColumnValue, data_type: &str) -> Result<SqlParam> {
    let param = match data_type {
        "smallint" | "int2" => typed(value, |v| {
            i16::try_from(as_i64(v)?).context("value out of range for smallint")
        }),
        "integer" | "int4" => typed(value, |v| {
            i32::try_from(as_i64(v)?).context("value out of range for integer")
        }),
        "bigint" | "int8" => typed(value, as_i64),
        "real" | "float4" => typed(value, |v| as_f64(v).map(|f| f as f32)),
        "double precision" | "float8" => typed(value, as_f64),
        "numeric" | "decimal" => typed(value, as_decimal),
        "boolean" | "bool" => typed(value, as_bool),
        "text" | "varchar" | "character varying" | "char" | "character" | "bpchar" | "name" => {
            typed(value, as_text)
        }
        "bytea" => typed(value, as_bytes),
        "date" => typed(value, as_date),
        "timestamp without time zone" | "timestamp" => typed(value, as_datetime),
        "timestamp with time zone" | "timestamptz" => {
            typed(value, |v| as_datetime(v).map(|dt| dt.and_utc()))
        }
        "time without time zone" | "time" => typed(value, as_time),
        "json" | "jsonb" => typed(value, as_json),
        "uuid" => typed(value, |v| {
            uuid::Uuid::parse_str(&as_text(v)?).context("invalid uuid")
        }),
        other => bail!("unsupported replica column type '{}'", other),
    };

    param.with_context(|| format!("cannot bind {:?} as {}", value, data_type))
}

fn typed<T, F>(value: &ColumnValue, convert: F) -> Result<SqlParam>
where
    T: ToSql + Sync + Send + 'static,
    F: FnOnce(&ColumnValue) -> Result<T>,
{
    if value.is_null() {
        return Ok(Box::new(None::<T>));
    }
    Ok(Box::new(Some(convert(value)?)))
}

fn as_i64(value: &ColumnValue) -> Result<i64> {
    match value {
        ColumnValue::Int(i) => Ok(*i),
        ColumnValue::UInt(u) => i64::try_from(*u).context("unsigned value exceeds bigint"),
        ColumnValue::Float(f) if f.is_finite() && f.fract() == 0.0 => Ok(*f as i64),
        ColumnValue::Text(s) => s.trim().parse().context("not an integer"),
        other => Err(anyhow!("{:?} is not an integer", other)),
    }
}

fn as_f64(value: &ColumnValue) -> Result<f64> {
    match value {
        ColumnValue::Float(f) => Ok(*f),
        ColumnValue::Int(i) => Ok(*i as f64),
        ColumnValue::UInt(u) => Ok(*u as f64),
        ColumnValue::Text(s) => s.trim().parse().context("not a number"),
        other => Err(anyhow!("{:?} is not a number", other)),
    }
}

fn as_decimal(value: &ColumnValue) -> Result<Decimal> {
    match value {
        ColumnValue::Int(i) => Ok(Decimal::from(*i)),
        ColumnValue::UInt(u) => Ok(Decimal::from(*u)),
        ColumnValue::Float(f) => Decimal::try_from(*f).context("float out of range for numeric"),
        ColumnValue::Text(s) => Decimal::from_str(s.trim()).context("not a decimal"),
        other => Err(anyhow!("{:?} is not a decimal", other)),
    }
}

fn as_bool(value: &ColumnValue) -> Result<bool> {
    match value {
        ColumnValue::Int(i) => Ok(*i != 0),
        ColumnValue::UInt(u) => Ok(*u != 0),
        ColumnValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "t" | "true" | "y" | "yes" => Ok(true),
            "0" | "f" | "false" | "n" | "no" => Ok(false),
            _ => bail!("'{}' is not a boolean", s),
        },
        other => Err(anyhow!("{:?} is not a boolean", other)),
    }
}

fn as_text(value: &ColumnValue) -> Result<String> {
    match value {
        ColumnValue::Bytes(b) => String::from_utf8(b.clone()).context("bytes are not UTF-8"),
        other => other
            .as_canonical_text()
            .map_err(|message| anyhow!(message))?
            .ok_or_else(|| anyhow!("unexpected NULL")),
    }
}

fn as_bytes(value: &ColumnValue) -> Result<Vec<u8>> {
    match value {
        ColumnValue::Bytes(b) => Ok(b.clone()),
        ColumnValue::Text(s) => Ok(s.as_bytes().to_vec()),
        other => Err(anyhow!("{:?} is not binary data", other)),
    }
}

fn as_date(value: &ColumnValue) -> Result<NaiveDate> {
    match value {
        ColumnValue::Date(d) => Ok(*d),
        ColumnValue::DateTime(dt) => Ok(dt.date()),
        ColumnValue::Text(s) => {
            NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").context("not a date")
        }
        other => Err(anyhow!("{:?} is not a date", other)),
    }
}

fn as_datetime(value: &ColumnValue) -> Result<NaiveDateTime> {
    match value {
        ColumnValue::DateTime(dt) => Ok(*dt),
        ColumnValue::Date(d) => Ok(d.and_time(NaiveTime::MIN)),
        ColumnValue::Text(s) => {
            NaiveDateTime::parse_from_str(s.trim(), DATETIME_FORMAT).context("not a timestamp")
        }
        other => Err(anyhow!("{:?} is not a timestamp", other)),
    }
}

fn as_time(value: &ColumnValue) -> Result<NaiveTime> {
    match value {
        ColumnValue::Time(s) | ColumnValue::Text(s) => {
            NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f").context("not a time of day")
        }
        ColumnValue::DateTime(dt) => Ok(dt.time()),
        other => Err(anyhow!("{:?} is not a time", other)),
    }
}

fn as_json(value: &ColumnValue) -> Result<serde_json::Value> {
    match value {
        ColumnValue::Text(s) => serde_json::from_str(s).context("not valid JSON"),
        ColumnValue::Int(i) => Ok(serde_json::Value::from(*i)),
        ColumnValue::UInt(u) => Ok(serde_json::Value::from(*u)),
        ColumnValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .ok_or_else(|| anyhow!("non-finite float in JSON column")),
        other => Err(anyhow!("{:?} is not JSON", other)),
    }
}
