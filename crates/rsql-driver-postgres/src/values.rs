//! Conversion between `rsql_core::Value` and PostgreSQL wire values

use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use postgres_types::{FromSql, IsNull, ToSql, Type};
use rsql_core::Value;
use std::error::Error as StdError;
use tokio_postgres::Row as PgRow;

type BoxError = Box<dyn StdError + Sync + Send>;

/// Owned parameter value handed to tokio-postgres
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PgParam {
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(uuid::Uuid),
    Json(serde_json::Value),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
}

impl PgParam {
    /// Convert a value for a parameter slot whose type the server inferred.
    ///
    /// Integers are narrowed or widened to the slot width so tokio-postgres
    /// writes the right number of bytes, and strings are parsed into the
    /// slot's type when they look like one.
    pub(crate) fn for_type(value: &Value, target: &Type) -> Self {
        match value {
            Value::Int16(v) => Self::coerce_int(i64::from(*v), target),
            Value::Int32(v) => Self::coerce_int(i64::from(*v), target),
            Value::Int64(v) => Self::coerce_int(*v, target),
            Value::Float32(v) if *target == Type::FLOAT8 => PgParam::Float64(f64::from(*v)),
            Value::Float64(v) if *target == Type::FLOAT4 => PgParam::Float32(*v as f32),
            Value::String(v) => Self::coerce_string(v, target),
            other => Self::from_value(other),
        }
    }

    /// Conversion used when no target type is known
    pub(crate) fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => PgParam::Null,
            Value::Bool(v) => PgParam::Bool(*v),
            Value::Int16(v) => PgParam::Int16(*v),
            Value::Int32(v) => PgParam::Int32(*v),
            Value::Int64(v) => PgParam::Int64(*v),
            Value::Float32(v) => PgParam::Float32(*v),
            Value::Float64(v) => PgParam::Float64(*v),
            Value::Decimal(v) | Value::String(v) => PgParam::Text(v.clone()),
            Value::Bytes(v) => PgParam::Bytes(v.clone()),
            Value::Uuid(v) => PgParam::Uuid(*v),
            Value::Json(v) => PgParam::Json(v.clone()),
            Value::Date(v) => PgParam::Date(*v),
            Value::Time(v) => PgParam::Time(*v),
            Value::DateTime(v) => PgParam::Timestamp(*v),
            Value::DateTimeUtc(v) => PgParam::TimestampTz(*v),
            Value::Array(_) => PgParam::Text(value.to_string()),
        }
    }

    fn coerce_int(value: i64, target: &Type) -> Self {
        match *target {
            Type::INT2 => PgParam::Int16(value as i16),
            Type::INT4 => PgParam::Int32(value as i32),
            Type::FLOAT8 => PgParam::Float64(value as f64),
            Type::TEXT | Type::VARCHAR | Type::NUMERIC => PgParam::Text(value.to_string()),
            _ => PgParam::Int64(value),
        }
    }

    fn coerce_string(value: &str, target: &Type) -> Self {
        let text = || PgParam::Text(value.to_string());
        match *target {
            Type::BOOL => match value.to_ascii_lowercase().as_str() {
                "t" | "true" | "yes" | "on" | "1" => PgParam::Bool(true),
                "f" | "false" | "no" | "off" | "0" => PgParam::Bool(false),
                _ => text(),
            },
            Type::INT2 | Type::INT4 | Type::INT8 => value
                .trim()
                .parse::<i64>()
                .map(|v| Self::coerce_int(v, target))
                .unwrap_or_else(|_| text()),
            Type::JSON | Type::JSONB => serde_json::from_str(value)
                .map(PgParam::Json)
                .unwrap_or_else(|_| text()),
            Type::UUID => uuid::Uuid::parse_str(value)
                .map(PgParam::Uuid)
                .unwrap_or_else(|_| text()),
            Type::DATE => NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .map(PgParam::Date)
                .unwrap_or_else(|_| text()),
            Type::TIME => NaiveTime::parse_from_str(value, "%H:%M:%S%.f")
                .map(PgParam::Time)
                .unwrap_or_else(|_| text()),
            Type::TIMESTAMP => parse_naive_timestamp(value)
                .map(PgParam::Timestamp)
                .unwrap_or_else(text),
            Type::TIMESTAMPTZ => DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|ts| ts.with_timezone(&Utc))
                .or_else(|| parse_naive_timestamp(value).map(|ts| ts.and_utc()))
                .map(PgParam::TimestampTz)
                .unwrap_or_else(text),
            _ => text(),
        }
    }
}

fn parse_naive_timestamp(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f").ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

impl ToSql for PgParam {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            PgParam::Null => Ok(IsNull::Yes),
            PgParam::Bool(v) => v.to_sql(ty, out),
            PgParam::Int16(v) => v.to_sql(ty, out),
            PgParam::Int32(v) => v.to_sql(ty, out),
            PgParam::Int64(v) => v.to_sql(ty, out),
            PgParam::Float32(v) => v.to_sql(ty, out),
            PgParam::Float64(v) => v.to_sql(ty, out),
            PgParam::Text(v) => v.to_sql(ty, out),
            PgParam::Bytes(v) => v.to_sql(ty, out),
            PgParam::Uuid(v) => v.to_sql(ty, out),
            PgParam::Json(v) => v.to_sql(ty, out),
            PgParam::Date(v) => v.to_sql(ty, out),
            PgParam::Time(v) => v.to_sql(ty, out),
            PgParam::Timestamp(v) => v.to_sql(ty, out),
            PgParam::TimestampTz(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_: &Type) -> bool {
        true
    }

    postgres_types::to_sql_checked!();
}

/// NUMERIC decoded into its exact decimal text
#[derive(Debug)]
struct NumericText(String);

impl NumericText {
    const NEGATIVE: u16 = 0x4000;
    const NAN: u16 = 0xC000;

    /// Decode the binary NUMERIC format: a header of digit count, weight,
    /// sign and display scale followed by base-10000 digit groups.
    fn decode(raw: &[u8]) -> Result<String, BoxError> {
        let header = |i: usize| u16::from_be_bytes([raw[i], raw[i + 1]]);
        if raw.len() < 8 {
            return Err("invalid NUMERIC payload: too short".into());
        }

        let ndigits = header(0) as usize;
        let weight = header(2) as i16;
        let sign = header(4);
        let dscale = header(6) as usize;

        if sign == Self::NAN {
            return Ok("NaN".to_string());
        }
        if raw.len() < 8 + ndigits * 2 {
            return Err("invalid NUMERIC payload: truncated digits".into());
        }

        let groups = (0..ndigits)
            .map(|i| header(8 + i * 2))
            .collect::<Vec<_>>();
        if groups.iter().any(|g| *g > 9999) {
            return Err("invalid NUMERIC payload: digit group out of range".into());
        }

        let int_groups = if weight >= 0 { weight as usize + 1 } else { 0 };
        let mut integer = String::new();
        for i in 0..int_groups {
            let group = groups.get(i).copied().unwrap_or(0);
            if i == 0 {
                integer.push_str(&group.to_string());
            } else {
                integer.push_str(&format!("{group:04}"));
            }
        }
        if integer.is_empty() {
            integer.push('0');
        }

        let mut fraction = String::new();
        if dscale > 0 {
            // Negative weight means leading zero groups after the point
            let leading_zero_groups = if weight < -1 { (-weight - 1) as usize } else { 0 };
            fraction.push_str(&"0000".repeat(leading_zero_groups));
            for group in groups.iter().skip(int_groups) {
                fraction.push_str(&format!("{group:04}"));
            }
            if fraction.len() < dscale {
                fraction.push_str(&"0".repeat(dscale - fraction.len()));
            } else {
                fraction.truncate(dscale);
            }
        }

        let mut out = String::new();
        if sign == Self::NEGATIVE {
            out.push('-');
        }
        out.push_str(&integer);
        if !fraction.is_empty() {
            out.push('.');
            out.push_str(&fraction);
        }
        Ok(out)
    }
}

impl<'a> FromSql<'a> for NumericText {
    fn from_sql(_: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        Self::decode(raw).map(Self)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

/// Raw UTF-8 payload for types without a dedicated decoder (enums, ...)
#[derive(Debug)]
struct RawText(String);

impl<'a> FromSql<'a> for RawText {
    fn from_sql(_: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        Ok(Self(String::from_utf8(raw.to_vec())?))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

fn get<'a, T: FromSql<'a>>(row: &'a PgRow, idx: usize) -> Option<T> {
    row.try_get::<_, Option<T>>(idx).ok().flatten()
}

fn get_array<'a, T: FromSql<'a>>(
    row: &'a PgRow,
    idx: usize,
    wrap: impl Fn(T) -> Value,
) -> Option<Value> {
    get::<Vec<T>>(row, idx).map(|items| Value::Array(items.into_iter().map(wrap).collect()))
}

/// Decode one column of a result row into a `Value`
pub(crate) fn decode_column(row: &PgRow, idx: usize) -> Value {
    let type_name = row.columns()[idx].type_().name();

    let value = match type_name {
        "bool" => get(row, idx).map(Value::Bool),
        "int2" => get(row, idx).map(Value::Int16),
        "int4" => get(row, idx).map(Value::Int32),
        "int8" => get(row, idx).map(Value::Int64),
        "oid" => get::<u32>(row, idx).map(|v| Value::Int64(i64::from(v))),
        "float4" => get(row, idx).map(Value::Float32),
        "float8" => get(row, idx).map(Value::Float64),
        "numeric" => get::<NumericText>(row, idx).map(|n| Value::Decimal(n.0)),
        "text" | "varchar" | "bpchar" | "name" | "char" => get(row, idx).map(Value::String),
        "bytea" => get(row, idx).map(Value::Bytes),
        "uuid" => get(row, idx).map(Value::Uuid),
        "json" | "jsonb" => get(row, idx).map(Value::Json),
        "date" => get(row, idx).map(Value::Date),
        "time" => get(row, idx).map(Value::Time),
        "timestamp" => get(row, idx).map(Value::DateTime),
        "timestamptz" => get(row, idx).map(Value::DateTimeUtc),
        "_bool" => get_array(row, idx, Value::Bool),
        "_int2" => get_array(row, idx, Value::Int16),
        "_int4" => get_array(row, idx, Value::Int32),
        "_int8" => get_array(row, idx, Value::Int64),
        "_float8" => get_array(row, idx, Value::Float64),
        "_text" | "_varchar" | "_bpchar" | "_name" => get_array(row, idx, Value::String),
        _ => get::<RawText>(row, idx).map(|v| Value::String(v.0)),
    };

    value.unwrap_or(Value::Null)
}
