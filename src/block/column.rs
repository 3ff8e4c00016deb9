//! Per-type column storage and its wire encoding

use serde_json::Value;
use tokio::io::AsyncRead;

use crate::error::{Error, Result};
use crate::protocol::{Reader, Writer};

/// Upper bound on capacity reserved up front from a wire row count
const MAX_RESERVED_ROWS: usize = 64 * 1024;

/// Decoded values of one column
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    UInt8(Vec<u8>),
    UInt16(Vec<u16>),
    UInt32(Vec<u32>),
    UInt64(Vec<u64>),
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    String(Vec<String>),
    FixedString { width: usize, values: Vec<Vec<u8>> },
    /// Days since the Unix epoch
    Date(Vec<u16>),
    /// Seconds since the Unix epoch
    DateTime(Vec<u32>),
}

async fn read_fixed<R, T, F, const N: usize>(
    rd: &mut Reader<R>,
    rows: usize,
    decode: F,
) -> Result<Vec<T>>
where
    R: AsyncRead + Unpin,
    F: Fn([u8; N]) -> T,
{
    let len = rows
        .checked_mul(N)
        .ok_or_else(|| Error::Protocol(format!("{} rows overflow the column size", rows)))?;
    let bytes = rd.bytes(len).await?;
    Ok(bytes
        .chunks_exact(N)
        .map(|chunk| {
            let mut arr = [0u8; N];
            arr.copy_from_slice(chunk);
            decode(arr)
        })
        .collect())
}

macro_rules! write_le {
    ($wr:expr, $values:expr) => {
        for value in $values {
            $wr.raw(&value.to_le_bytes());
        }
    };
}

fn parse_width(type_name: &str) -> Option<usize> {
    type_name
        .strip_prefix("FixedString(")?
        .strip_suffix(')')?
        .trim()
        .parse()
        .ok()
        .filter(|width| *width > 0)
}

impl ColumnData {
    /// Empty storage for a column of the given type.
    pub fn for_type(type_name: &str) -> Result<Self> {
        let data = match type_name {
            "UInt8" | "Bool" => ColumnData::UInt8(Vec::new()),
            "UInt16" => ColumnData::UInt16(Vec::new()),
            "UInt32" => ColumnData::UInt32(Vec::new()),
            "UInt64" => ColumnData::UInt64(Vec::new()),
            "Int8" => ColumnData::Int8(Vec::new()),
            "Int16" => ColumnData::Int16(Vec::new()),
            "Int32" => ColumnData::Int32(Vec::new()),
            "Int64" => ColumnData::Int64(Vec::new()),
            "Float32" => ColumnData::Float32(Vec::new()),
            "Float64" => ColumnData::Float64(Vec::new()),
            "String" => ColumnData::String(Vec::new()),
            "Date" => ColumnData::Date(Vec::new()),
            "DateTime" => ColumnData::DateTime(Vec::new()),
            t if t.starts_with("DateTime(") => ColumnData::DateTime(Vec::new()),
            t if t.starts_with("FixedString(") => {
                let width = parse_width(t)
                    .ok_or_else(|| Error::UnsupportedColumnType(t.to_string()))?;
                ColumnData::FixedString {
                    width,
                    values: Vec::new(),
                }
            }
            other => return Err(Error::UnsupportedColumnType(other.to_string())),
        };
        Ok(data)
    }

    /// Whether this storage can carry a column declared as `type_name`.
    pub fn matches_type(&self, type_name: &str) -> bool {
        match (ColumnData::for_type(type_name), self) {
            (
                Ok(ColumnData::FixedString { width: expected, .. }),
                ColumnData::FixedString { width, .. },
            ) => expected == *width,
            (Ok(empty), data) => std::mem::discriminant(&empty) == std::mem::discriminant(data),
            (Err(_), _) => false,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnData::UInt8(v) => v.len(),
            ColumnData::UInt16(v) => v.len(),
            ColumnData::UInt32(v) => v.len(),
            ColumnData::UInt64(v) => v.len(),
            ColumnData::Int8(v) => v.len(),
            ColumnData::Int16(v) => v.len(),
            ColumnData::Int32(v) => v.len(),
            ColumnData::Int64(v) => v.len(),
            ColumnData::Float32(v) => v.len(),
            ColumnData::Float64(v) => v.len(),
            ColumnData::String(v) => v.len(),
            ColumnData::FixedString { values, .. } => values.len(),
            ColumnData::Date(v) => v.len(),
            ColumnData::DateTime(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the contents with `rows` values read from the wire.
    pub async fn read_from<R: AsyncRead + Unpin>(
        &mut self,
        rd: &mut Reader<R>,
        rows: usize,
    ) -> Result<()> {
        match self {
            ColumnData::UInt8(v) => *v = rd.bytes(rows).await?,
            ColumnData::UInt16(v) => *v = read_fixed(rd, rows, u16::from_le_bytes).await?,
            ColumnData::UInt32(v) => *v = read_fixed(rd, rows, u32::from_le_bytes).await?,
            ColumnData::UInt64(v) => *v = read_fixed(rd, rows, u64::from_le_bytes).await?,
            ColumnData::Int8(v) => *v = read_fixed(rd, rows, i8::from_le_bytes).await?,
            ColumnData::Int16(v) => *v = read_fixed(rd, rows, i16::from_le_bytes).await?,
            ColumnData::Int32(v) => *v = read_fixed(rd, rows, i32::from_le_bytes).await?,
            ColumnData::Int64(v) => *v = read_fixed(rd, rows, i64::from_le_bytes).await?,
            ColumnData::Float32(v) => *v = read_fixed(rd, rows, f32::from_le_bytes).await?,
            ColumnData::Float64(v) => *v = read_fixed(rd, rows, f64::from_le_bytes).await?,
            ColumnData::Date(v) => *v = read_fixed(rd, rows, u16::from_le_bytes).await?,
            ColumnData::DateTime(v) => *v = read_fixed(rd, rows, u32::from_le_bytes).await?,
            ColumnData::String(v) => {
                v.clear();
                v.reserve(rows.min(MAX_RESERVED_ROWS));
                for _ in 0..rows {
                    v.push(rd.string().await?);
                }
            }
            ColumnData::FixedString { width, values } => {
                values.clear();
                values.reserve(rows.min(MAX_RESERVED_ROWS));
                for _ in 0..rows {
                    values.push(rd.bytes(*width).await?);
                }
            }
        }
        Ok(())
    }

    pub fn write_to(&self, wr: &mut Writer) {
        match self {
            ColumnData::UInt8(v) => wr.raw(v),
            ColumnData::UInt16(v) => write_le!(wr, v),
            ColumnData::UInt32(v) => write_le!(wr, v),
            ColumnData::UInt64(v) => write_le!(wr, v),
            ColumnData::Int8(v) => write_le!(wr, v),
            ColumnData::Int16(v) => write_le!(wr, v),
            ColumnData::Int32(v) => write_le!(wr, v),
            ColumnData::Int64(v) => write_le!(wr, v),
            ColumnData::Float32(v) => write_le!(wr, v),
            ColumnData::Float64(v) => write_le!(wr, v),
            ColumnData::Date(v) => write_le!(wr, v),
            ColumnData::DateTime(v) => write_le!(wr, v),
            ColumnData::String(v) => {
                for value in v {
                    wr.string(value);
                }
            }
            ColumnData::FixedString { width, values } => {
                for value in values {
                    let n = value.len().min(*width);
                    wr.raw(&value[..n]);
                    wr.raw(&vec![0u8; *width - n]);
                }
            }
        }
    }

    /// Render one value for display.
    pub fn value(&self, row: usize) -> Option<Value> {
        if row >= self.len() {
            return None;
        }
        let value = match self {
            ColumnData::UInt8(v) => Value::from(v[row]),
            ColumnData::UInt16(v) => Value::from(v[row]),
            ColumnData::UInt32(v) => Value::from(v[row]),
            ColumnData::UInt64(v) => Value::from(v[row]),
            ColumnData::Int8(v) => Value::from(v[row]),
            ColumnData::Int16(v) => Value::from(v[row]),
            ColumnData::Int32(v) => Value::from(v[row]),
            ColumnData::Int64(v) => Value::from(v[row]),
            ColumnData::Float32(v) => serde_json::Number::from_f64(f64::from(v[row]))
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ColumnData::Float64(v) => serde_json::Number::from_f64(v[row])
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ColumnData::String(v) => Value::String(v[row].clone()),
            ColumnData::FixedString { values, .. } => {
                let bytes = &values[row];
                let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
                Value::String(String::from_utf8_lossy(&bytes[..end]).into_owned())
            }
            ColumnData::Date(v) => chrono::NaiveDate::from_ymd_opt(1970, 1, 1)
                .and_then(|epoch| epoch.checked_add_days(chrono::Days::new(u64::from(v[row]))))
                .map(|date| Value::String(date.format("%Y-%m-%d").to_string()))
                .unwrap_or(Value::Null),
            ColumnData::DateTime(v) => chrono::DateTime::from_timestamp(i64::from(v[row]), 0)
                .map(|ts| Value::String(ts.format("%Y-%m-%d %H:%M:%S").to_string()))
                .unwrap_or(Value::Null),
        };
        Some(value)
    }

    pub fn as_strings(&self) -> Option<&[String]> {
        match self {
            ColumnData::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64s(&self) -> Option<&[i64]> {
        match self {
            ColumnData::Int64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i8s(&self) -> Option<&[i8]> {
        match self {
            ColumnData::Int8(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_datetimes(&self) -> Option<&[u32]> {
        match self {
            ColumnData::DateTime(v) => Some(v),
            _ => None,
        }
    }
}
