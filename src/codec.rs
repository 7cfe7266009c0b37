//! Typed value encoding and decoding for the text and binary protocols.

use crate::constants::{column_flag, field_type};
use crate::error::{Error, Result};
use crate::packet::Parser;
use crate::value::Value;
use bytes::{BufMut, BytesMut};
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

/// Character set id of pure binary columns.
const BINARY_CHARSET: u16 = 63;

/// Decoded column definition from a result-set or prepare response.
#[derive(Debug, Clone)]
pub struct ColumnDefinition {
    /// Column alias as selected
    pub name: String,
    /// Wire type tag, see [`crate::constants::field_type`]
    pub column_type: u8,
    /// Column flags, see [`crate::constants::column_flag`]
    pub flags: u16,
    /// Declared fractional-second or decimal scale
    pub decimals: u8,
    /// Character set id; 63 means binary
    pub character_set: u16,
}

impl ColumnDefinition {
    /// Parse one column definition packet.
    pub(crate) fn parse(p: &mut Parser<'_>) -> Result<Self> {
        p.skip_lenenc_str()?; // catalog
        p.skip_lenenc_str()?; // schema
        p.skip_lenenc_str()?; // table
        p.skip_lenenc_str()?; // org_table
        let name = p.get_lenenc_str()?.to_string();
        p.skip_lenenc_str()?; // org_name
        p.get_lenenc()?; // length of fixed-length fields
        let character_set = p.get_u16()?;
        p.get_u32()?; // column_length
        let column_type = p.get_u8()?;
        let flags = p.get_u16()?;
        let decimals = p.get_u8()?;
        p.get_u16()?; // filler
        Ok(ColumnDefinition {
            name,
            column_type,
            flags,
            decimals,
            character_set,
        })
    }

    /// Whether the column holds unsigned numbers.
    pub fn is_unsigned(&self) -> bool {
        self.flags & column_flag::UNSIGNED != 0
    }

    /// Whether the column is a TIMESTAMP or DATETIME.
    pub fn is_datetime_like(&self) -> bool {
        matches!(
            self.column_type,
            field_type::TIMESTAMP | field_type::DATETIME
        )
    }

    /// Whether the column may be NULL.
    pub fn is_nullable(&self) -> bool {
        self.flags & column_flag::NOT_NULL == 0
    }
}

/// Decoded OK packet.
#[derive(Debug, Clone, Default)]
pub struct OkPacket {
    /// Rows changed by the statement
    pub affected_rows: u64,
    /// Id generated for an AUTO_INCREMENT insert, 0 when none
    pub last_insert_id: u64,
    /// Server status bits, see [`crate::constants::status`]
    pub status_flags: u16,
    /// Warning count
    pub warnings: u16,
}

/// Parse an OK payload; the 0x00 (or 0xFE terminator) header byte has
/// already been consumed.
pub(crate) fn parse_ok_payload(p: &mut Parser<'_>) -> Result<OkPacket> {
    let affected_rows = p.get_lenenc()?;
    let last_insert_id = p.get_lenenc()?;
    let status_flags = if p.remaining() >= 2 { p.get_u16()? } else { 0 };
    let warnings = if p.remaining() >= 2 { p.get_u16()? } else { 0 };
    Ok(OkPacket {
        affected_rows,
        last_insert_id,
        status_flags,
        warnings,
    })
}

/// Parse an ERR payload into [`Error::Server`]; the 0xFF header byte has
/// already been consumed.
pub(crate) fn parse_err_payload(p: &mut Parser<'_>) -> Error {
    let code = match p.get_u16() {
        Ok(c) => c,
        Err(e) => return e,
    };
    let mut sql_state = "HY000".to_string();
    if p.peek_u8() == Some(b'#') {
        let _ = p.get_u8();
        if let Ok(state) = p.get_bytes(5) {
            sql_state = String::from_utf8_lossy(state).to_string();
        }
    }
    let message = p.get_eof_str().unwrap_or("<non-utf8 message>").to_string();
    Error::Server {
        code,
        sql_state,
        message,
    }
}

// ============================================================================
// Binary protocol: parameter encoding
// ============================================================================

/// Width-inferred wire type for an integer bind without a pinned target type.
fn inferred_int_type(v: i64) -> u8 {
    if i8::try_from(v).is_ok() {
        field_type::TINY
    } else if i16::try_from(v).is_ok() {
        field_type::SHORT
    } else if i32::try_from(v).is_ok() {
        field_type::LONG
    } else {
        field_type::LONG_LONG
    }
}

/// Type tag + unsigned flag sent in the COM_STMT_EXECUTE type block.
pub(crate) fn param_type_tag(v: &Value) -> [u8; 2] {
    match v {
        Value::Null => [field_type::NULL, 0],
        Value::Bool(_) => [field_type::TINY, 0],
        Value::Int32(n) => [inferred_int_type(i64::from(*n)), 0],
        Value::Int64(n) => [inferred_int_type(*n), 0],
        Value::UInt64(_) => [field_type::LONG_LONG, 0x80],
        Value::Float(_) => [field_type::FLOAT, 0],
        Value::Double(_) => [field_type::DOUBLE, 0],
        Value::Decimal(_) => [field_type::NEW_DECIMAL, 0],
        Value::Text(_) => [field_type::VAR_STRING, 0],
        Value::Bytes(_) => [field_type::BLOB, 0],
        Value::Date(_) => [field_type::DATE, 0],
        Value::Time(_) => [field_type::TIME, 0],
        Value::DateTime(_) => [field_type::DATETIME, 0],
    }
}

/// Append the binary wire form of a bind value.
///
/// NULL binds carry no bytes here; they live in the null bitmap.
pub(crate) fn encode_binary_value(buf: &mut BytesMut, v: &Value) {
    match v {
        Value::Null => {}
        Value::Bool(b) => buf.put_u8(u8::from(*b)),
        Value::Int32(n) => encode_int(buf, i64::from(*n)),
        Value::Int64(n) => encode_int(buf, *n),
        Value::UInt64(n) => buf.put_u64_le(*n),
        Value::Float(f) => buf.put_f32_le(*f),
        Value::Double(f) => buf.put_f64_le(*f),
        Value::Decimal(s) => put_lenenc_slice(buf, s.as_bytes()),
        Value::Text(s) => put_lenenc_slice(buf, s.as_bytes()),
        Value::Bytes(b) => put_lenenc_slice(buf, b),
        Value::Date(d) => encode_date(buf, d),
        Value::Time(t) => encode_time(buf, t),
        Value::DateTime(dt) => encode_datetime(buf, dt),
    }
}

fn encode_int(buf: &mut BytesMut, v: i64) {
    match inferred_int_type(v) {
        field_type::TINY => buf.put_i8(v as i8),
        field_type::SHORT => buf.put_i16_le(v as i16),
        field_type::LONG => buf.put_i32_le(v as i32),
        _ => buf.put_i64_le(v),
    }
}

fn put_lenenc_slice(buf: &mut BytesMut, s: &[u8]) {
    let len = s.len() as u64;
    match len {
        0..=250 => buf.put_u8(len as u8),
        251..=0xFFFF => {
            buf.put_u8(0xFC);
            buf.put_u16_le(len as u16);
        }
        0x1_0000..=0xFF_FFFF => {
            buf.put_u8(0xFD);
            buf.put_uint_le(len, 3);
        }
        _ => {
            buf.put_u8(0xFE);
            buf.put_u64_le(len);
        }
    }
    buf.put(s);
}

fn encode_date(buf: &mut BytesMut, d: &NaiveDate) {
    buf.put_u8(4);
    buf.put_u16_le(d.year() as u16);
    buf.put_u8(d.month() as u8);
    buf.put_u8(d.day() as u8);
}

/// Datetime wire structure: 4, 7 or 11 bytes of content; the microsecond
/// block is present only when the value carries sub-second precision.
fn encode_datetime(buf: &mut BytesMut, dt: &NaiveDateTime) {
    let micros = dt.and_utc().timestamp_subsec_micros();
    let has_time = dt.hour() != 0 || dt.minute() != 0 || dt.second() != 0;
    let len: u8 = if micros != 0 {
        11
    } else if has_time {
        7
    } else {
        4
    };
    buf.put_u8(len);
    buf.put_u16_le(dt.year() as u16);
    buf.put_u8(dt.month() as u8);
    buf.put_u8(dt.day() as u8);
    if len >= 7 {
        buf.put_u8(dt.hour() as u8);
        buf.put_u8(dt.minute() as u8);
        buf.put_u8(dt.second() as u8);
    }
    if len == 11 {
        buf.put_u32_le(micros);
    }
}

fn encode_time(buf: &mut BytesMut, t: &NaiveTime) {
    let micros = t.nanosecond() / 1000;
    let len: u8 = if micros != 0 { 12 } else { 8 };
    buf.put_u8(len);
    buf.put_u8(0); // not negative
    buf.put_u32_le(0); // days
    buf.put_u8(t.hour() as u8);
    buf.put_u8(t.minute() as u8);
    buf.put_u8(t.second() as u8);
    if len == 12 {
        buf.put_u32_le(micros);
    }
}

// ============================================================================
// Temporal bind validation
// ============================================================================

/// Validate a bind value independent of any target type.
///
/// The wire format carries years as u16; calendar values outside 0..=9999
/// cannot be represented and are refused up front.
pub(crate) fn validate_bind(value: &Value) -> Result<()> {
    let year = match value {
        Value::Date(d) => d.year(),
        Value::DateTime(dt) => dt.year(),
        _ => return Ok(()),
    };
    if (0..=9999).contains(&year) {
        Ok(())
    } else {
        Err(Error::invalid_datetime(format!(
            "year {year} is outside the representable range"
        )))
    }
}

/// Validate (and possibly coerce) a bind whose target parameter type is a
/// TIMESTAMP/DATETIME column.
///
/// Numeric binds are refused with SQLSTATE `22007` rather than coerced into
/// a calendar value; strings must parse as a calendar point. Returns the
/// replacement value when a textual bind was promoted to a proper temporal.
pub(crate) fn coerce_temporal(value: &Value, target_type: u8) -> Result<Option<Value>> {
    if !matches!(target_type, field_type::TIMESTAMP | field_type::DATETIME) {
        return Ok(None);
    }
    match value {
        Value::Null | Value::Date(_) | Value::Time(_) | Value::DateTime(_) => Ok(None),
        Value::Text(s) => parse_datetime_text(s).map(|dt| Some(Value::DateTime(dt))),
        Value::Bool(_)
        | Value::Int32(_)
        | Value::Int64(_)
        | Value::UInt64(_)
        | Value::Float(_)
        | Value::Double(_)
        | Value::Decimal(_) => Err(Error::invalid_datetime(format!(
            "cannot bind {} value to a TIMESTAMP/DATETIME column",
            value.type_name()
        ))),
        Value::Bytes(_) => Err(Error::invalid_datetime(
            "cannot bind BINARY value to a TIMESTAMP/DATETIME column",
        )),
    }
}

/// Parse `YYYY-MM-DD[ HH:MM[:SS[.ffffff]]]` (space or `T` separator) into a
/// calendar point, rejecting anything chrono cannot represent.
pub(crate) fn parse_datetime_text(s: &str) -> Result<NaiveDateTime> {
    let s = s.trim();
    let invalid = || Error::invalid_datetime(format!("'{s}' is not a valid datetime"));

    let (date_part, time_part) = match s.find([' ', 'T']) {
        Some(idx) => (&s[..idx], Some(&s[idx + 1..])),
        None => (s, None),
    };

    let mut dp = date_part.split('-');
    let year: i32 = dp.next().and_then(|v| v.parse().ok()).ok_or_else(invalid)?;
    let month: u32 = dp.next().and_then(|v| v.parse().ok()).ok_or_else(invalid)?;
    let day: u32 = dp.next().and_then(|v| v.parse().ok()).ok_or_else(invalid)?;
    if dp.next().is_some() || !(0..=9999).contains(&year) {
        return Err(invalid());
    }
    let date = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(invalid)?;

    let time = match time_part {
        None | Some("") => NaiveTime::from_hms_opt(0, 0, 0).ok_or_else(invalid)?,
        Some(t) => {
            let (hms, frac) = match t.find('.') {
                Some(idx) => (&t[..idx], Some(&t[idx + 1..])),
                None => (t, None),
            };
            let mut tp = hms.split(':');
            let hour: u32 = tp.next().and_then(|v| v.parse().ok()).ok_or_else(invalid)?;
            let min: u32 = tp.next().and_then(|v| v.parse().ok()).ok_or_else(invalid)?;
            let sec: u32 = match tp.next() {
                Some(v) => v.parse().map_err(|_| invalid())?,
                None => 0,
            };
            if tp.next().is_some() {
                return Err(invalid());
            }
            let micros = match frac {
                None => 0,
                Some(f) if f.is_empty() || f.len() > 6 => return Err(invalid()),
                Some(f) => {
                    let digits: u32 = f.parse().map_err(|_| invalid())?;
                    digits * 10u32.pow(6 - f.len() as u32)
                }
            };
            NaiveTime::from_hms_micro_opt(hour, min, sec, micros).ok_or_else(invalid)?
        }
    };

    Ok(NaiveDateTime::new(date, time))
}

// ============================================================================
// Binary protocol: row decoding
// ============================================================================

/// Decode one binary-row cell for the given column.
pub(crate) fn decode_binary_value(p: &mut Parser<'_>, col: &ColumnDefinition) -> Result<Value> {
    match col.column_type {
        field_type::NULL => Ok(Value::Null),
        field_type::TINY => {
            let b = p.get_u8()?;
            Ok(if col.is_unsigned() {
                Value::Int32(i32::from(b))
            } else {
                Value::Int32(i32::from(b as i8))
            })
        }
        field_type::SHORT | field_type::YEAR => {
            let v = p.get_u16()?;
            Ok(if col.is_unsigned() {
                Value::Int32(i32::from(v))
            } else {
                Value::Int32(i32::from(v as i16))
            })
        }
        field_type::LONG | field_type::INT24 => {
            let v = p.get_u32()?;
            Ok(if col.is_unsigned() {
                Value::Int64(i64::from(v))
            } else {
                Value::Int32(v as i32)
            })
        }
        field_type::LONG_LONG => {
            let v = p.get_u64()?;
            Ok(if col.is_unsigned() {
                Value::UInt64(v)
            } else {
                Value::Int64(v as i64)
            })
        }
        field_type::FLOAT => {
            let b = p.get_bytes(4)?;
            Ok(Value::Float(f32::from_le_bytes([b[0], b[1], b[2], b[3]])))
        }
        field_type::DOUBLE => {
            let b = p.get_bytes(8)?;
            Ok(Value::Double(f64::from_le_bytes([
                b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
            ])))
        }
        field_type::DECIMAL | field_type::NEW_DECIMAL => {
            Ok(Value::Decimal(p.get_lenenc_str()?.to_string()))
        }
        field_type::DATE => decode_binary_date(p),
        field_type::DATETIME | field_type::TIMESTAMP => decode_binary_datetime(p),
        field_type::TIME => decode_binary_time(p),
        field_type::BIT | field_type::GEOMETRY => Ok(Value::Bytes(p.get_lenenc_bytes()?.to_vec())),
        _ => {
            let raw = p.get_lenenc_bytes()?;
            if col.character_set == BINARY_CHARSET {
                Ok(Value::Bytes(raw.to_vec()))
            } else {
                Ok(Value::Text(
                    std::str::from_utf8(raw)
                        .map_err(|e| Error::Protocol(format!("invalid UTF-8 in row: {e}")))?
                        .to_string(),
                ))
            }
        }
    }
}

fn decode_binary_date(p: &mut Parser<'_>) -> Result<Value> {
    let len = p.get_u8()?;
    if len == 0 {
        // zero date
        return Ok(Value::Null);
    }
    if len < 4 {
        return Err(Error::Protocol(format!("bad DATE payload length {len}")));
    }
    let year = i32::from(p.get_u16()?);
    let month = u32::from(p.get_u8()?);
    let day = u32::from(p.get_u8()?);
    p.skip(len as usize - 4)?;
    match NaiveDate::from_ymd_opt(year, month, day) {
        Some(d) => Ok(Value::Date(d)),
        None => Ok(Value::Null),
    }
}

/// Fractional seconds always decode to the 6-digit microsecond canonical
/// form, whatever the declared column scale.
fn decode_binary_datetime(p: &mut Parser<'_>) -> Result<Value> {
    let len = p.get_u8()?;
    if len == 0 {
        return Ok(Value::Null);
    }
    if len < 4 {
        return Err(Error::Protocol(format!("bad DATETIME payload length {len}")));
    }
    let year = i32::from(p.get_u16()?);
    let month = u32::from(p.get_u8()?);
    let day = u32::from(p.get_u8()?);
    let (hour, min, sec) = if len >= 7 {
        (
            u32::from(p.get_u8()?),
            u32::from(p.get_u8()?),
            u32::from(p.get_u8()?),
        )
    } else {
        (0, 0, 0)
    };
    let micros = if len >= 11 { p.get_u32()? } else { 0 };
    let date = NaiveDate::from_ymd_opt(year, month, day);
    let time = NaiveTime::from_hms_micro_opt(hour, min, sec, micros);
    match (date, time) {
        (Some(d), Some(t)) => Ok(Value::DateTime(NaiveDateTime::new(d, t))),
        _ => Ok(Value::Null),
    }
}

fn decode_binary_time(p: &mut Parser<'_>) -> Result<Value> {
    let len = p.get_u8()?;
    if len == 0 {
        return Ok(Value::Time(NaiveTime::MIN));
    }
    let negative = p.get_u8()? != 0;
    let days = p.get_u32()?;
    let hour = u32::from(p.get_u8()?);
    let min = u32::from(p.get_u8()?);
    let sec = u32::from(p.get_u8()?);
    let micros = if len >= 12 { p.get_u32()? } else { 0 };
    if negative || days != 0 {
        // outside the range of a time-of-day; surface the raw representation
        let sign = if negative { "-" } else { "" };
        return Ok(Value::Text(format!(
            "{sign}{:02}:{min:02}:{sec:02}.{micros:06}",
            days * 24 + hour
        )));
    }
    match NaiveTime::from_hms_micro_opt(hour, min, sec, micros) {
        Some(t) => Ok(Value::Time(t)),
        None => Ok(Value::Null),
    }
}

// ============================================================================
// Text protocol: row decoding
// ============================================================================

/// Decode one text-row cell for the given column.
pub(crate) fn decode_text_value(raw: &[u8], col: &ColumnDefinition) -> Result<Value> {
    let text = || -> Result<&str> {
        std::str::from_utf8(raw).map_err(|e| Error::Protocol(format!("invalid UTF-8 in row: {e}")))
    };
    match col.column_type {
        field_type::NULL => Ok(Value::Null),
        field_type::TINY | field_type::SHORT | field_type::LONG | field_type::INT24 => {
            let s = text()?;
            s.parse::<i64>()
                .map(|v| {
                    if i32::try_from(v).is_ok() {
                        Value::Int32(v as i32)
                    } else {
                        Value::Int64(v)
                    }
                })
                .map_err(|e| Error::Protocol(format!("bad integer '{s}': {e}")))
        }
        field_type::LONG_LONG | field_type::YEAR => {
            let s = text()?;
            if col.is_unsigned() {
                s.parse::<u64>().map(Value::UInt64)
            } else {
                s.parse::<i64>().map(Value::Int64)
            }
            .map_err(|e| Error::Protocol(format!("bad integer '{s}': {e}")))
        }
        field_type::FLOAT => {
            let s = text()?;
            s.parse::<f32>()
                .map(Value::Float)
                .map_err(|e| Error::Protocol(format!("bad float '{s}': {e}")))
        }
        field_type::DOUBLE => {
            let s = text()?;
            s.parse::<f64>()
                .map(Value::Double)
                .map_err(|e| Error::Protocol(format!("bad double '{s}': {e}")))
        }
        field_type::DECIMAL | field_type::NEW_DECIMAL => Ok(Value::Decimal(text()?.to_string())),
        field_type::DATE => {
            let s = text()?;
            if s.starts_with("0000-00-00") {
                return Ok(Value::Null);
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(Value::Date)
                .map_err(|e| Error::Protocol(format!("bad date '{s}': {e}")))
        }
        field_type::DATETIME | field_type::TIMESTAMP => {
            let s = text()?;
            if s.starts_with("0000-00-00") {
                return Ok(Value::Null);
            }
            parse_datetime_text(s)
                .map(Value::DateTime)
                .map_err(|_| Error::Protocol(format!("bad datetime '{s}'")))
        }
        field_type::TIME => {
            let s = text()?;
            match NaiveTime::parse_from_str(s, "%H:%M:%S%.f") {
                Ok(t) => Ok(Value::Time(t)),
                // negative or >24h durations keep their text form
                Err(_) => Ok(Value::Text(s.to_string())),
            }
        }
        _ => {
            if col.character_set == BINARY_CHARSET {
                Ok(Value::Bytes(raw.to_vec()))
            } else {
                Ok(Value::Text(text()?.to_string()))
            }
        }
    }
}

// ============================================================================
// Text protocol: literal rendering
// ============================================================================

/// Render a bind value as a SQL literal for text-protocol inlining.
pub(crate) fn escape_literal(sql: &mut String, v: &Value) -> Result<()> {
    match v {
        Value::Null => sql.push_str("NULL"),
        Value::Bool(b) => sql.push_str(if *b { "1" } else { "0" }),
        Value::Int32(n) => sql.push_str(&n.to_string()),
        Value::Int64(n) => sql.push_str(&n.to_string()),
        Value::UInt64(n) => sql.push_str(&n.to_string()),
        Value::Float(f) => sql.push_str(&f.to_string()),
        Value::Double(f) => sql.push_str(&f.to_string()),
        Value::Decimal(s) => {
            if !s.is_empty()
                && s.bytes()
                    .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'+' | b'-' | b'e' | b'E'))
            {
                sql.push_str(s);
            } else {
                return Err(Error::TypeConversion(format!(
                    "'{s}' is not a numeric decimal representation"
                )));
            }
        }
        Value::Text(s) => escape_string(sql, s),
        Value::Bytes(b) => {
            if b.is_empty() {
                sql.push_str("''");
            } else {
                sql.push_str("0x");
                for byte in b {
                    sql.push_str(&format!("{byte:02X}"));
                }
            }
        }
        Value::Date(d) => sql.push_str(&format!("'{}'", d.format("%Y-%m-%d"))),
        Value::Time(t) => sql.push_str(&format!("'{}'", t.format("%H:%M:%S%.6f"))),
        Value::DateTime(dt) => sql.push_str(&format!("'{}'", dt.format("%Y-%m-%d %H:%M:%S%.6f"))),
    }
    Ok(())
}

fn escape_string(sql: &mut String, s: &str) {
    sql.push('\'');
    for c in s.chars() {
        match c {
            '\'' => sql.push_str("\\'"),
            '"' => sql.push_str("\\\""),
            '\\' => sql.push_str("\\\\"),
            '\n' => sql.push_str("\\n"),
            '\r' => sql.push_str("\\r"),
            '\0' => sql.push_str("\\0"),
            '\u{1a}' => sql.push_str("\\Z"),
            c => sql.push(c),
        }
    }
    sql.push('\'');
}

/// Inline bind values into text-protocol SQL, replacing each `?` with its
/// escaped literal. The bind count must match the placeholder count exactly;
/// the mismatch is detected before any bytes travel.
pub(crate) fn inline_parameters(sql: &str, params: &[Value]) -> Result<String> {
    let expected = count_placeholders(sql);
    if expected != params.len() {
        return Err(Error::bind_mismatch(expected, params.len()));
    }
    #[derive(PartialEq)]
    enum S {
        Normal,
        Single,
        Double,
        Backtick,
        LineComment,
        BlockComment,
    }
    let mut state = S::Normal;
    let mut out = String::with_capacity(sql.len() + params.len() * 8);
    let mut next_param = params.iter();
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match state {
            S::Normal => match c {
                '?' => {
                    let v = next_param.next().ok_or_else(|| {
                        Error::bind_mismatch(expected, params.len())
                    })?;
                    escape_literal(&mut out, v)?;
                    continue;
                }
                '\'' => state = S::Single,
                '"' => state = S::Double,
                '`' => state = S::Backtick,
                '#' => state = S::LineComment,
                '-' if chars.peek() == Some(&'-') => state = S::LineComment,
                '/' if chars.peek() == Some(&'*') => {
                    state = S::BlockComment;
                    out.push('/');
                    out.push(chars.next().expect("peeked"));
                    continue;
                }
                _ => {}
            },
            S::Single => match c {
                '\\' => {
                    out.push(c);
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                    continue;
                }
                '\'' => state = S::Normal,
                _ => {}
            },
            S::Double => match c {
                '\\' => {
                    out.push(c);
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                    continue;
                }
                '"' => state = S::Normal,
                _ => {}
            },
            S::Backtick => {
                if c == '`' {
                    state = S::Normal;
                }
            }
            S::LineComment => {
                if c == '\n' {
                    state = S::Normal;
                }
            }
            S::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    state = S::Normal;
                    out.push(c);
                    out.push(chars.next().expect("peeked"));
                    continue;
                }
            }
        }
        out.push(c);
    }
    Ok(out)
}

// ============================================================================
// Placeholder counting
// ============================================================================

/// Count `?` placeholders outside strings, identifiers and comments.
pub(crate) fn count_placeholders(sql: &str) -> usize {
    #[derive(PartialEq)]
    enum S {
        Normal,
        Single,
        Double,
        Backtick,
        LineComment,
        BlockComment,
    }
    let mut state = S::Normal;
    let mut count = 0;
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match state {
            S::Normal => match c {
                '?' => count += 1,
                '\'' => state = S::Single,
                '"' => state = S::Double,
                '`' => state = S::Backtick,
                '#' => state = S::LineComment,
                '-' if chars.peek() == Some(&'-') => {
                    chars.next();
                    state = S::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = S::BlockComment;
                }
                _ => {}
            },
            S::Single => match c {
                '\\' => {
                    chars.next();
                }
                '\'' => state = S::Normal,
                _ => {}
            },
            S::Double => match c {
                '\\' => {
                    chars.next();
                }
                '"' => state = S::Normal,
                _ => {}
            },
            S::Backtick => {
                if c == '`' {
                    state = S::Normal;
                }
            }
            S::LineComment => {
                if c == '\n' {
                    state = S::Normal;
                }
            }
            S::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = S::Normal;
                }
            }
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::field_type;

    fn dt(s: &str) -> NaiveDateTime {
        parse_datetime_text(s).unwrap()
    }

    fn timestamp_col() -> ColumnDefinition {
        ColumnDefinition {
            name: "t1".to_string(),
            column_type: field_type::TIMESTAMP,
            flags: column_flag::BINARY,
            decimals: 6,
            character_set: BINARY_CHARSET,
        }
    }

    #[test]
    fn datetime_binary_roundtrip_preserves_micros() {
        let input = dt("2018-12-15 05:08:10.123456");
        let mut buf = BytesMut::new();
        encode_datetime(&mut buf, &input);
        assert_eq!(buf[0], 11);
        let mut p = Parser::new(&buf);
        let back = decode_binary_datetime(&mut p).unwrap();
        assert_eq!(back, Value::DateTime(input));
    }

    #[test]
    fn date_only_datetime_roundtrips_to_midnight() {
        let input = dt("2010-01-12");
        let mut buf = BytesMut::new();
        encode_datetime(&mut buf, &input);
        assert_eq!(buf[0], 4);
        let mut p = Parser::new(&buf);
        let back = decode_binary_datetime(&mut p).unwrap();
        assert_eq!(back, Value::DateTime(dt("2010-01-12 00:00:00")));
    }

    #[test]
    fn short_fraction_normalizes_to_micros() {
        // 0.0014 seconds is 1400 microseconds
        let input = dt("2010-01-12 05:08:09.0014");
        assert_eq!(input.and_utc().timestamp_subsec_micros(), 1400);
        let mut buf = BytesMut::new();
        encode_datetime(&mut buf, &input);
        let mut p = Parser::new(&buf);
        assert_eq!(
            decode_binary_datetime(&mut p).unwrap(),
            Value::DateTime(dt("2010-01-12 05:08:09.001400"))
        );
    }

    #[test]
    fn numeric_binds_to_timestamp_are_rejected_with_22007() {
        let col = timestamp_col();
        for v in [
            Value::Int32(1),
            Value::Int64(-9),
            Value::Int64(i64::MAX),
            Value::UInt64(9_223_372_036_854_775_807),
            Value::Float(127.0),
            Value::Double(-128.0),
            Value::Decimal("9223372036854775807".to_string()),
            Value::Text("1".to_string()),
            Value::Text("9223372036854775807".to_string()),
            Value::Text("-9".to_string()),
        ] {
            let err = coerce_temporal(&v, col.column_type).unwrap_err();
            assert_eq!(err.sql_state(), "22007", "value {v:?}");
        }
    }

    #[test]
    fn datetime_strings_are_coerced_not_rejected() {
        let col = timestamp_col();
        let coerced = coerce_temporal(&Value::Text("2018-12-15T05:08:10.123456".into()), col.column_type)
            .unwrap()
            .unwrap();
        assert_eq!(coerced, Value::DateTime(dt("2018-12-15 05:08:10.123456")));
    }

    #[test]
    fn calendar_invalid_components_are_rejected() {
        for s in [
            "2018-13-01",
            "2018-02-30",
            "2018-12-15 25:00:00",
            "2018-12-15 05:61:00",
            "10000-01-01",
            "2018-12-15 05:08:10.1234567",
        ] {
            let err = parse_datetime_text(s).unwrap_err();
            assert_eq!(err.sql_state(), "22007", "input {s}");
        }
    }

    #[test]
    fn temporal_values_pass_the_guard() {
        let col = timestamp_col();
        assert!(coerce_temporal(&Value::DateTime(dt("2025-05-12 05:08:11.123")), col.column_type)
            .unwrap()
            .is_none());
        assert!(coerce_temporal(&Value::Null, col.column_type).unwrap().is_none());
        // non-temporal targets are untouched
        assert!(coerce_temporal(&Value::Int64(1), field_type::LONG_LONG).unwrap().is_none());
    }

    #[test]
    fn int_width_inference() {
        assert_eq!(param_type_tag(&Value::Int64(5))[0], field_type::TINY);
        assert_eq!(param_type_tag(&Value::Int64(300))[0], field_type::SHORT);
        assert_eq!(param_type_tag(&Value::Int64(70_000))[0], field_type::LONG);
        assert_eq!(
            param_type_tag(&Value::Int64(1 << 40))[0],
            field_type::LONG_LONG
        );
        assert_eq!(param_type_tag(&Value::UInt64(1)), [field_type::LONG_LONG, 0x80]);

        let mut buf = BytesMut::new();
        encode_binary_value(&mut buf, &Value::Int64(300));
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn text_row_decoding() {
        let int_col = ColumnDefinition {
            name: "n".into(),
            column_type: field_type::LONG_LONG,
            flags: 0,
            decimals: 0,
            character_set: 45,
        };
        assert_eq!(decode_text_value(b"42", &int_col).unwrap(), Value::Int64(42));

        let ts_col = timestamp_col();
        assert_eq!(
            decode_text_value(b"2018-12-15 05:08:10.123456", &ts_col).unwrap(),
            Value::DateTime(dt("2018-12-15 05:08:10.123456"))
        );
        assert_eq!(decode_text_value(b"0000-00-00 00:00:00", &ts_col).unwrap(), Value::Null);
    }

    #[test]
    fn literal_escaping() {
        let mut sql = String::new();
        escape_literal(&mut sql, &Value::Text("it's \\ here".into())).unwrap();
        assert_eq!(sql, r"'it\'s \\ here'");

        let mut sql = String::new();
        escape_literal(&mut sql, &Value::Bytes(vec![0xDE, 0xAD])).unwrap();
        assert_eq!(sql, "0xDEAD");

        let mut sql = String::new();
        escape_literal(&mut sql, &Value::DateTime(dt("2018-12-15 05:08:10.123"))).unwrap();
        assert_eq!(sql, "'2018-12-15 05:08:10.123000'");

        let mut sql = String::new();
        assert!(escape_literal(&mut sql, &Value::Decimal("1; DROP".into())).is_err());
    }

    #[test]
    fn parameter_inlining() {
        let sql = inline_parameters(
            "INSERT INTO t VALUES (?, ?, '?')",
            &[Value::Int64(7), Value::Text("a'b".into())],
        )
        .unwrap();
        assert_eq!(sql, r"INSERT INTO t VALUES (7, 'a\'b', '?')");

        // arity mismatch fails before anything is produced
        let err = inline_parameters("SELECT ?", &[]).unwrap_err();
        assert!(matches!(err, Error::Bind { .. }));
        let err = inline_parameters("SELECT 1", &[Value::Int64(1)]).unwrap_err();
        assert!(matches!(err, Error::Bind { .. }));
    }

    #[test]
    fn placeholder_counting_skips_strings_and_comments() {
        assert_eq!(count_placeholders("SELECT ?, ?"), 2);
        assert_eq!(count_placeholders("SELECT '?', \"?\", `a?b`, ?"), 1);
        assert_eq!(count_placeholders("SELECT 1 -- ?\n, ?"), 1);
        assert_eq!(count_placeholders("SELECT /* ? */ ?"), 1);
        assert_eq!(count_placeholders("SELECT '\\'?'"), 0);
        assert_eq!(count_placeholders("INSERT INTO t VALUES (?,?,?)"), 3);
    }
}
