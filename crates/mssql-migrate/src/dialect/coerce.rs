//! Per-value coercion applied at import time.
//!
//! Rules run in order and the first match wins:
//!
//! 1. the empty string becomes NULL (whitespace is kept verbatim)
//! 2. `"true"`/`"false"` in any case become a boolean, or 1/0 on targets
//!    without one
//! 3. GUID text bound for a native UUID column becomes a UUID; a native UUID
//!    bound anywhere else becomes uppercase hyphenated text
//! 4. timestamp-shaped text loses its UTC offset and any fractional digits
//!    beyond the target column's limit (truncated, never rounded)
//!
//! The fractional limit is per column: a declared precision such as
//! `datetime2(3)` wins, then a per-type override (SQL Server `datetime`),
//! then the engine maximum.
//!
//! Anything else passes through unchanged. Coercion never fails.

use std::borrow::Cow;

use chrono::{NaiveDateTime, NaiveTime, Timelike};
use uuid::Uuid;

use crate::core::value::{Row, SqlNullType, SqlValue};

/// Engine-specific coercion settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoercionRules {
    /// Bind booleans as integer 1/0.
    pub booleans_as_integers: bool,
    /// Maximum fractional-second digits the target keeps.
    pub max_fraction_digits: Option<usize>,
    /// Lowercase base types with a tighter fixed limit than the engine's.
    pub fixed_fraction_types: &'static [(&'static str, usize)],
    /// Lowercase type names the target uses for native UUID columns.
    pub native_uuid_types: &'static [&'static str],
}

impl CoercionRules {
    pub const POSTGRES: CoercionRules = CoercionRules {
        booleans_as_integers: false,
        max_fraction_digits: Some(6),
        fixed_fraction_types: &[],
        native_uuid_types: &["uuid"],
    };

    pub const MYSQL: CoercionRules = CoercionRules {
        booleans_as_integers: false,
        max_fraction_digits: Some(6),
        fixed_fraction_types: &[],
        native_uuid_types: &[],
    };

    pub const SQLITE: CoercionRules = CoercionRules {
        booleans_as_integers: true,
        max_fraction_digits: None,
        fixed_fraction_types: &[],
        native_uuid_types: &[],
    };

    /// `datetime2`, `time` and `datetimeoffset` keep 100ns ticks; the legacy
    /// `datetime` keeps milliseconds and `smalldatetime` none.
    pub const SQLSERVER: CoercionRules = CoercionRules {
        booleans_as_integers: true,
        max_fraction_digits: Some(7),
        fixed_fraction_types: &[("datetime", 3), ("smalldatetime", 0)],
        native_uuid_types: &["uniqueidentifier"],
    };

    /// Whether `target_type` is a native UUID type for this engine.
    pub fn is_uuid_column(&self, target_type: &str) -> bool {
        let base = base_type_name(target_type);
        self.native_uuid_types.iter().any(|t| *t == base)
    }

    /// Fractional-second digits a column of `target_type` keeps.
    pub fn fraction_digits_for(&self, target_type: &str) -> Option<usize> {
        let base = base_type_name(target_type);
        let fixed = self
            .fixed_fraction_types
            .iter()
            .find(|(t, _)| *t == base)
            .map(|(_, digits)| *digits);
        let declared = if is_temporal_type(&base) || base == "time" {
            declared_precision(target_type)
        } else {
            None
        };

        [fixed, declared, self.max_fraction_digits]
            .into_iter()
            .flatten()
            .min()
    }
}

/// Coerce one value for a column of `target_type`.
pub fn coerce_value(
    value: SqlValue<'static>,
    target_type: &str,
    rules: &CoercionRules,
) -> SqlValue<'static> {
    match value {
        SqlValue::Text(text) => coerce_text(text, target_type, rules),
        SqlValue::Uuid(u) if !rules.is_uuid_column(target_type) => {
            SqlValue::Text(Cow::Owned(u.hyphenated().to_string().to_uppercase()))
        }
        SqlValue::DateTime(dt) => {
            SqlValue::DateTime(truncate_datetime(dt, rules.fraction_digits_for(target_type)))
        }
        SqlValue::DateTimeOffset(dto) if !is_offset_aware(target_type) => SqlValue::DateTime(
            truncate_datetime(dto.naive_local(), rules.fraction_digits_for(target_type)),
        ),
        SqlValue::Time(t) => SqlValue::Time(truncate_time(t, rules.fraction_digits_for(target_type))),
        other => other,
    }
}

/// Coerce every slot of `row` against the type at the same position.
///
/// Slots without a declared target type are coerced against `""`.
pub fn coerce_row(row: Row, target_types: &[String], rules: &CoercionRules) -> Row {
    row.into_iter()
        .enumerate()
        .map(|(i, v)| {
            let ty = target_types.get(i).map(String::as_str).unwrap_or("");
            coerce_value(v, ty, rules)
        })
        .collect()
}

fn coerce_text(text: Cow<'static, str>, target_type: &str, rules: &CoercionRules) -> SqlValue<'static> {
    if text.is_empty() {
        return SqlValue::Null(SqlNullType::String);
    }

    if text.eq_ignore_ascii_case("true") || text.eq_ignore_ascii_case("false") {
        let b = text.eq_ignore_ascii_case("true");
        return if rules.booleans_as_integers {
            SqlValue::I32(i32::from(b))
        } else {
            SqlValue::Bool(b)
        };
    }

    if rules.is_uuid_column(target_type) {
        if let Ok(u) = Uuid::parse_str(text.trim()) {
            return SqlValue::Uuid(u);
        }
    }

    if let Some(cleaned) = clean_timestamp(&text, rules.fraction_digits_for(target_type)) {
        if is_temporal_type(target_type) {
            if let Some(dt) = parse_naive_timestamp(&cleaned) {
                return SqlValue::DateTime(dt);
            }
        }
        return SqlValue::Text(Cow::Owned(cleaned));
    }

    SqlValue::Text(text)
}

/// Lowercase base type name without arguments, e.g. `"datetime2"`.
fn base_type_name(target_type: &str) -> String {
    let lower = target_type.trim().to_ascii_lowercase();
    match lower.find('(') {
        Some(i) => lower[..i].trim().to_string(),
        None => lower,
    }
}

/// The `n` of `type(n)`, e.g. 3 for `datetime2(3)`.
fn declared_precision(target_type: &str) -> Option<usize> {
    let open = target_type.find('(')?;
    let close = target_type[open..].find(')')? + open;
    target_type[open + 1..close].trim().parse().ok()
}

/// Whether a target column stores date and time together.
pub fn is_temporal_type(target_type: &str) -> bool {
    let base = base_type_name(target_type);
    base.contains("timestamp") || base.contains("datetime")
}

fn is_offset_aware(target_type: &str) -> bool {
    let base = base_type_name(target_type);
    base == "timestamptz" || base.contains("with time zone") || base == "datetimeoffset"
}

/// Strip a trailing UTC offset and truncate fractional seconds.
///
/// Returns `None` when `s` is not shaped like
/// `YYYY-MM-DD[T ]HH:MM[:SS[.f+]][Z|±HH[:MM]]`.
pub fn clean_timestamp(s: &str, max_fraction_digits: Option<usize>) -> Option<String> {
    let b = s.as_bytes();
    let digits = |r: std::ops::Range<usize>| b.get(r).is_some_and(|d| d.iter().all(u8::is_ascii_digit));

    if b.len() < 16
        || !digits(0..4)
        || b[4] != b'-'
        || !digits(5..7)
        || b[7] != b'-'
        || !digits(8..10)
        || !(b[10] == b'T' || b[10] == b' ')
        || !digits(11..13)
        || b[13] != b':'
        || !digits(14..16)
    {
        return None;
    }

    let mut pos = 16;
    if b.get(pos) == Some(&b':') && digits(pos + 1..pos + 3) {
        pos += 3;
    }
    let seconds_end = pos;

    let mut fraction = "";
    if b.get(pos) == Some(&b'.') {
        let start = pos + 1;
        let mut end = start;
        while b.get(end).is_some_and(u8::is_ascii_digit) {
            end += 1;
        }
        if end == start {
            return None;
        }
        fraction = &s[start..end];
        pos = end;
    }

    if !is_offset_suffix(&s[pos..]) {
        return None;
    }

    let mut out = s[..seconds_end].to_string();
    let keep = max_fraction_digits.map_or(fraction.len(), |m| fraction.len().min(m));
    if keep > 0 {
        out.push('.');
        out.push_str(&fraction[..keep]);
    }
    Some(out)
}

fn is_offset_suffix(rest: &str) -> bool {
    let b = rest.as_bytes();
    let two_digits = |r: std::ops::Range<usize>| b.get(r).is_some_and(|d| d.iter().all(u8::is_ascii_digit));

    match b.first() {
        None => true,
        Some(b'Z' | b'z') => b.len() == 1,
        Some(b'+' | b'-') => match b.len() {
            3 => two_digits(1..3),
            5 => two_digits(1..5),
            6 => two_digits(1..3) && b[3] == b':' && two_digits(4..6),
            _ => false,
        },
        _ => false,
    }
}

fn parse_naive_timestamp(s: &str) -> Option<NaiveDateTime> {
    let normalized = s.replacen('T', " ", 1);
    NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%d %H:%M"))
        .ok()
}

fn truncated_nanos(nanos: u32, max_fraction_digits: Option<usize>) -> u32 {
    match max_fraction_digits {
        Some(digits) if digits < 9 => {
            let unit = 10u32.pow(9 - digits as u32);
            nanos - nanos % unit
        }
        _ => nanos,
    }
}

/// Drop fractional digits beyond the limit without rounding.
pub fn truncate_datetime(dt: NaiveDateTime, max_fraction_digits: Option<usize>) -> NaiveDateTime {
    let nanos = truncated_nanos(dt.nanosecond(), max_fraction_digits);
    dt.with_nanosecond(nanos).unwrap_or(dt)
}

fn truncate_time(t: NaiveTime, max_fraction_digits: Option<usize>) -> NaiveTime {
    let nanos = truncated_nanos(t.nanosecond(), max_fraction_digits);
    t.with_nanosecond(nanos).unwrap_or(t)
}
