//! Pure value validators composed into field validation chains.
//!
//! Every check here takes raw input and returns either a cleaned value or a
//! human-readable message. Field descriptors assemble these into fixed-order
//! chains; nothing in this module knows about fields or models.

use std::sync::OnceLock;

use chrono::{Local, NaiveDate};
use regex::Regex;
use serde_json::Value;

/// Thread-safe cache of compiled patterns.
///
/// Patterns come from user-declared field options and are compiled lazily on
/// first use, then reused for the lifetime of the program.
struct RegexCache {
    cache: std::sync::RwLock<std::collections::HashMap<String, Regex>>,
}

impl RegexCache {
    fn new() -> Self {
        Self {
            cache: std::sync::RwLock::new(std::collections::HashMap::new()),
        }
    }

    fn get_or_compile(&self, pattern: &str) -> Result<Regex, regex::Error> {
        // Fast path: check if already cached
        {
            let cache = self.cache.read().unwrap();
            if let Some(regex) = cache.get(pattern) {
                return Ok(regex.clone());
            }
        }

        // Slow path: compile and cache
        let regex = Regex::new(pattern)?;
        {
            let mut cache = self.cache.write().unwrap();
            cache.insert(pattern.to_string(), regex.clone());
        }
        Ok(regex)
    }
}

/// Global regex cache singleton.
fn regex_cache() -> &'static RegexCache {
    static CACHE: OnceLock<RegexCache> = OnceLock::new();
    CACHE.get_or_init(RegexCache::new)
}

/// Check a string against a cached regex pattern.
///
/// Returns `false` when the pattern itself is invalid (logged as a warning)
/// so a bad field declaration fails the value rather than panicking.
pub fn matches_pattern(value: &str, pattern: &str) -> bool {
    match regex_cache().get_or_compile(pattern) {
        Ok(regex) => regex.is_match(value),
        Err(e) => {
            tracing::warn!(
                pattern = pattern,
                error = %e,
                "Invalid regex pattern in validation, treating as non-match"
            );
            false
        }
    }
}

/// Substitute the first `%s` in a message template with `arg`.
#[must_use]
pub fn format_message(template: &str, arg: &str) -> String {
    match template.find("%s") {
        Some(pos) => format!("{}{}{}", &template[..pos], arg, &template[pos + 2..]),
        None => template.to_string(),
    }
}

/// Empty raw input: absent, JSON null, or the empty string.
#[must_use]
pub fn is_empty_input(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

// ---- string ----

/// Coerce raw input to a string. Numbers and booleans stringify; structured
/// values are rejected.
pub fn as_string(value: &Value) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err("expected a string value".to_string()),
    }
}

#[must_use]
pub fn trim(value: &str) -> String {
    value.trim().to_string()
}

#[must_use]
pub fn delete_spaces(value: &str) -> String {
    value.split_whitespace().collect()
}

pub fn check_maxlength(value: &str, maxlength: usize) -> Result<(), String> {
    if value.chars().count() > maxlength {
        Err(format!("value cannot exceed {maxlength} characters"))
    } else {
        Ok(())
    }
}

pub fn check_minlength(value: &str, minlength: usize) -> Result<(), String> {
    if value.chars().count() < minlength {
        Err(format!("value cannot be shorter than {minlength} characters"))
    } else {
        Ok(())
    }
}

pub fn check_length(value: &str, length: usize) -> Result<(), String> {
    if value.chars().count() == length {
        Ok(())
    } else {
        Err(format!("value must be exactly {length} characters"))
    }
}

pub fn check_pattern(value: &str, pattern: &str, message: Option<&str>) -> Result<(), String> {
    if matches_pattern(value, pattern) {
        Ok(())
    } else {
        let template = message.unwrap_or("invalid format: %s");
        Err(format_message(template, value))
    }
}

// ---- numeric ----

/// Coerce to an integer. Strings parse; floats must have no fraction.
pub fn as_integer(value: &Value) -> Result<i64, String> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i)
            } else if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 && f.is_finite() {
                    Ok(f as i64)
                } else {
                    Err("expected an integer".to_string())
                }
            } else {
                Err("expected an integer".to_string())
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| "expected an integer".to_string()),
        _ => Err("expected an integer".to_string()),
    }
}

/// Coerce to a finite float. NaN and infinities are rejected.
pub fn as_float(value: &Value) -> Result<f64, String> {
    let n = match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| "expected a number".to_string())?,
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| "expected a number".to_string())?,
        _ => return Err("expected a number".to_string()),
    };
    if n.is_finite() {
        Ok(n)
    } else {
        Err("expected a finite number".to_string())
    }
}

pub fn check_min(value: f64, min: f64) -> Result<(), String> {
    if value < min {
        Err(format!("value must be at least {min}"))
    } else {
        Ok(())
    }
}

pub fn check_max(value: f64, max: f64) -> Result<(), String> {
    if value > max {
        Err(format!("value cannot exceed {max}"))
    } else {
        Ok(())
    }
}

// ---- boolean ----

/// Token map shared by boolean coercion and the default CN choices.
pub fn as_boolean(value: &Value) -> Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => match n.as_i64() {
            Some(1) => Ok(true),
            Some(0) => Ok(false),
            _ => Err("expected a boolean".to_string()),
        },
        Value::String(s) => match s.as_str() {
            "t" | "on" | "1" | "true" | "TRUE" | "是" => Ok(true),
            "f" | "off" | "0" | "false" | "FALSE" | "否" => Ok(false),
            _ => Err("expected a boolean".to_string()),
        },
        _ => Err("expected a boolean".to_string()),
    }
}

// ---- temporal ----

static DATE_RE: &str = r"^(\d{4})-(\d{1,2})-(\d{1,2})$";
static TIME_RE: &str = r"^(\d{1,2}):(\d{1,2}):(\d{1,2})(\.\d+)?$";
static DATETIME_RE: &str =
    r"^(\d{4})-(\d{1,2})-(\d{1,2})[ T](\d{1,2}):(\d{1,2}):(\d{1,2})(\.\d+)?$";

fn capture_u32(caps: &regex::Captures<'_>, i: usize) -> u32 {
    caps.get(i).map_or(0, |m| m.as_str().parse().unwrap_or(0))
}

fn check_hms(hour: u32, minute: u32, second: u32) -> bool {
    hour < 24 && minute < 60 && second < 60
}

/// Validate and normalize a `YYYY-MM-DD` date. Leap years are honored.
pub fn as_date(value: &Value, pattern_override: Option<&str>) -> Result<String, String> {
    let s = as_string(value)?;
    let s = s.trim();
    let pattern = pattern_override.unwrap_or(DATE_RE);
    let regex = regex_cache()
        .get_or_compile(pattern)
        .map_err(|e| format!("invalid date pattern: {e}"))?;
    let caps = regex.captures(s).ok_or_else(|| "invalid date format".to_string())?;
    let (year, month, day) = (
        capture_u32(&caps, 1) as i32,
        capture_u32(&caps, 2),
        capture_u32(&caps, 3),
    );
    let date = NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| "invalid date value".to_string())?;
    Ok(date.format("%Y-%m-%d").to_string())
}

/// Validate an `HH:MM:SS` time, optional fractional seconds kept verbatim.
pub fn as_time(value: &Value) -> Result<String, String> {
    let s = as_string(value)?;
    let s = s.trim();
    let regex = regex_cache()
        .get_or_compile(TIME_RE)
        .map_err(|e| format!("invalid time pattern: {e}"))?;
    let caps = regex.captures(s).ok_or_else(|| "invalid time format".to_string())?;
    let (hour, minute, second) = (
        capture_u32(&caps, 1),
        capture_u32(&caps, 2),
        capture_u32(&caps, 3),
    );
    if check_hms(hour, minute, second) {
        Ok(s.to_string())
    } else {
        Err("invalid time value".to_string())
    }
}

/// Validate a `YYYY-MM-DD HH:MM:SS` datetime and normalize the separator to
/// a single space.
pub fn as_datetime(value: &Value) -> Result<String, String> {
    let s = as_string(value)?;
    let s = s.trim();
    let regex = regex_cache()
        .get_or_compile(DATETIME_RE)
        .map_err(|e| format!("invalid datetime pattern: {e}"))?;
    let caps = regex
        .captures(s)
        .ok_or_else(|| "invalid datetime format".to_string())?;
    let (year, month, day) = (
        capture_u32(&caps, 1) as i32,
        capture_u32(&caps, 2),
        capture_u32(&caps, 3),
    );
    let (hour, minute, second) = (
        capture_u32(&caps, 4),
        capture_u32(&caps, 5),
        capture_u32(&caps, 6),
    );
    if NaiveDate::from_ymd_opt(year, month, day).is_none() || !check_hms(hour, minute, second) {
        return Err("invalid datetime value".to_string());
    }
    let frac = caps.get(7).map_or("", |m| m.as_str());
    Ok(format!(
        "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}{frac}"
    ))
}

/// Validate `YYYY-MM` (or `YYYY.MM`), month 01..=12.
pub fn as_year_month(value: &Value) -> Result<String, String> {
    let s = as_string(value)?;
    let s = s.trim();
    if !matches_pattern(s, r"^\d{4}[-.][01]\d$") {
        return Err("invalid year-month format".to_string());
    }
    let month: u32 = s[5..].parse().map_err(|_| "invalid month".to_string())?;
    if (1..=12).contains(&month) {
        Ok(s.to_string())
    } else {
        Err("month must be between 1 and 12".to_string())
    }
}

/// Current local time as `YYYY-MM-DD HH:MM:SS`.
#[must_use]
pub fn localtime() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

// ---- format ----

pub fn check_url(value: &str) -> Result<(), String> {
    if matches_pattern(value, r"^(https?:)?//") {
        Ok(())
    } else {
        Err("invalid url".to_string())
    }
}

pub fn check_email(value: &str) -> Result<(), String> {
    if matches_pattern(value, r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$") {
        Ok(())
    } else {
        Err("invalid email address".to_string())
    }
}

/// Chinese resident identity number: 18 characters with a weighted checksum
/// over the first 17 digits.
pub fn check_sfzh(value: &str) -> Result<(), String> {
    const WEIGHTS: [u32; 17] = [7, 9, 10, 5, 8, 4, 2, 1, 6, 3, 7, 9, 10, 5, 8, 4, 2];
    const CHECK_DIGITS: [char; 11] = ['1', '0', 'X', '9', '8', '7', '6', '5', '4', '3', '2'];
    let chars: Vec<char> = value.chars().collect();
    if chars.len() != 18 {
        return Err("id number must be 18 characters".to_string());
    }
    let mut sum = 0u32;
    for (i, ch) in chars[..17].iter().enumerate() {
        let digit = ch
            .to_digit(10)
            .ok_or_else(|| "invalid id number".to_string())?;
        sum += digit * WEIGHTS[i];
    }
    let expected = CHECK_DIGITS[(sum % 11) as usize];
    let last = chars[17].to_ascii_uppercase();
    if last == expected {
        Ok(())
    } else {
        Err("invalid id number".to_string())
    }
}

// ---- json ----

pub fn encode_json(value: &Value) -> Result<String, String> {
    serde_json::to_string(value).map_err(|e| format!("cannot encode value as json: {e}"))
}

pub fn decode_json(text: &str) -> Result<Value, String> {
    serde_json::from_str(text).map_err(|e| format!("invalid json: {e}"))
}

// ---- sizes ----

/// Parse human-readable byte sizes: `"10"`, `"2k"`, `"5m"`, `"1g"`.
pub fn parse_byte_size(text: &str) -> Result<u64, String> {
    let lower = text.trim().to_lowercase();
    let (digits, unit) = match lower.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => lower.split_at(pos),
        None => (lower.as_str(), ""),
    };
    let base: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size: {text}"))?;
    let multiplier = match unit.trim() {
        "" => 1,
        "k" | "kb" => 1024,
        "m" | "mb" => 1024 * 1024,
        "g" | "gb" => 1024 * 1024 * 1024,
        _ => return Err(format!("invalid size unit: {unit}")),
    };
    Ok(base * multiplier)
}
