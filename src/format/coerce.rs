use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;

/// Datetime layouts tried after RFC3339 and plain epochs fail.
const FALLBACK_LAYOUTS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
];

/// Coerces a cell to `f64`. `None` means the cell must be dropped.
pub fn to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
        Value::Array(items) => bytes_to_string(items).and_then(|text| text.trim().parse().ok()),
        Value::Null | Value::Object(_) => None,
    }
}

/// Renders a cell as a label value. Nulls carry no label.
pub fn to_label(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Array(items) => {
            Some(bytes_to_string(items).unwrap_or_else(|| value.to_string()))
        }
        Value::Object(_) => Some(value.to_string()),
    }
}

/// Byte arrays come through JSON as arrays of small integers.
fn bytes_to_string(items: &[Value]) -> Option<String> {
    let bytes = items
        .iter()
        .map(|item| item.as_u64().and_then(|b| u8::try_from(b).ok()))
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

/// Parses a time cell into Unix seconds.
///
/// `format` is either empty, one of `epoch_second`, `epoch_millis`,
/// `epoch_micros`, `epoch_nanos`, or a chrono strftime pattern.
pub fn parse_time(value: &Value, format: &str) -> Option<i64> {
    let format = format.trim();
    if let Some(divisor) = epoch_divisor(format) {
        return match value {
            Value::Number(number) => number
                .as_i64()
                .map(|n| n / divisor)
                .or_else(|| number.as_f64().map(|f| (f / divisor as f64) as i64)),
            Value::String(text) => text.trim().parse::<i64>().ok().map(|n| n / divisor),
            _ => None,
        };
    }

    match value {
        Value::Number(number) => match number.as_i64() {
            Some(n) => Some(epoch_by_digits(n)),
            None => number.as_f64().and_then(float_epoch),
        },
        Value::String(text) => parse_time_str(text.trim(), format),
        Value::Array(items) => {
            bytes_to_string(items).and_then(|text| parse_time_str(text.trim(), format))
        }
        _ => None,
    }
}

fn epoch_divisor(format: &str) -> Option<i64> {
    match format {
        "epoch_second" | "epoch_seconds" | "epoch" => Some(1),
        "epoch_millis" => Some(1_000),
        "epoch_micros" => Some(1_000_000),
        "epoch_nanos" => Some(1_000_000_000),
        _ => None,
    }
}

/// Interprets an integer epoch by its digit count: 13 ms, 16 µs, 19 ns, else seconds.
pub fn epoch_by_digits(n: i64) -> i64 {
    match n.unsigned_abs().to_string().len() {
        13 => n / 1_000,
        16 => n / 1_000_000,
        19 => n / 1_000_000_000,
        _ => n,
    }
}

/// Float epochs follow the integer digit rule on their whole part.
fn float_epoch(f: f64) -> Option<i64> {
    f.is_finite().then(|| epoch_by_digits(f.trunc() as i64))
}

/// String time parsing in precedence order. See [`parse_time`].
pub fn parse_time_str(text: &str, format: &str) -> Option<i64> {
    if !format.is_empty() {
        return parse_with_layout(text, format);
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.timestamp());
    }
    if let Ok(n) = text.parse::<i64>() {
        return Some(epoch_by_digits(n));
    }
    if let Some(seconds) = text.parse::<f64>().ok().and_then(float_epoch) {
        return Some(seconds);
    }
    FALLBACK_LAYOUTS
        .iter()
        .find_map(|layout| parse_with_layout(text, layout))
}

fn parse_with_layout(text: &str, layout: &str) -> Option<i64> {
    if let Ok(parsed) = DateTime::parse_from_str(text, layout) {
        return Some(parsed.timestamp());
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(text, layout) {
        return Some(parsed.and_utc().timestamp());
    }
    NaiveDate::parse_from_str(text, layout)
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|datetime| datetime.and_utc().timestamp())
}
