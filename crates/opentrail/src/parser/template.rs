//! Template parser for delimiter-separated application logs.
//!
//! A format string such as `{{timestamp}}|{{level}}|{{tracking_id}}|{{message}}`
//! is compiled into literal delimiters once at construction; each incoming
//! line is then split at those delimiters. The message is the final field
//! and may itself contain the delimiter. Lines that do not match the
//! template shape are never dropped: they become `UNKNOWN`-level entries
//! carrying the whole raw line.

use chrono::{DateTime, Datelike, NaiveDateTime, Utc};

use super::LogParser;
use crate::error::ParseError;
use crate::model::LogEntry;

/// Facility assigned to template-parsed entries (local0).
const TEMPLATE_FACILITY: u8 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Timestamp,
    Level,
    TrackingId,
    Message,
    /// Unknown placeholder: the field is consumed but its value discarded.
    Ignored,
}

impl Field {
    fn from_name(name: &str) -> Self {
        match name {
            "timestamp" => Field::Timestamp,
            "level" => Field::Level,
            "tracking_id" => Field::TrackingId,
            "message" => Field::Message,
            _ => Field::Ignored,
        }
    }
}

pub struct TemplateParser {
    prefix: String,
    fields: Vec<Field>,
    /// Literal delimiter following field i; length is `fields.len() - 1`.
    separators: Vec<String>,
    suffix: String,
}

impl TemplateParser {
    pub fn new(format: &str) -> Result<Self, ParseError> {
        if format.is_empty() {
            return Err(ParseError::BadFormat("empty template".to_string()));
        }

        let mut fields = Vec::new();
        let mut literals = Vec::new();
        let mut current = String::new();
        let mut rest = format;

        while let Some(start) = rest.find("{{") {
            current.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or_else(|| {
                ParseError::BadFormat("unterminated placeholder".to_string())
            })?;
            literals.push(std::mem::take(&mut current));
            fields.push(Field::from_name(&after[..end]));
            rest = &after[end + 2..];
        }
        current.push_str(rest);

        if fields.is_empty() {
            return Err(ParseError::BadFormat(
                "template has no placeholders".to_string(),
            ));
        }

        let prefix = literals.remove(0);
        Ok(Self {
            prefix,
            fields,
            separators: literals,
            suffix: current,
        })
    }

    /// Split the line at the compiled delimiters. `None` means the line
    /// does not match the template shape.
    fn split<'a>(&self, raw: &'a str) -> Option<Vec<&'a str>> {
        let mut rest = raw.strip_prefix(self.prefix.as_str())?;
        let mut values = Vec::with_capacity(self.fields.len());
        for sep in &self.separators {
            let idx = rest.find(sep.as_str())?;
            values.push(&rest[..idx]);
            rest = &rest[idx + sep.len()..];
        }
        let last = if self.suffix.is_empty() {
            rest
        } else {
            rest.strip_suffix(self.suffix.as_str())?
        };
        values.push(last);
        Some(values)
    }

    fn build_entry(&self, values: Vec<&str>) -> LogEntry {
        let mut timestamp_raw = "";
        let mut level_raw: Option<&str> = None;
        let mut tracking_id = "";
        let mut message = "";

        for (field, value) in self.fields.iter().zip(values) {
            match field {
                Field::Timestamp => timestamp_raw = value,
                Field::Level => level_raw = Some(value),
                Field::TrackingId => tracking_id = value,
                Field::Message => message = value,
                Field::Ignored => {}
            }
        }

        let level = normalize_level(level_raw.unwrap_or("INFO"));
        let severity = severity_for_level(&level);
        let timestamp = parse_timestamp(timestamp_raw).unwrap_or_else(Utc::now);

        let mut entry = LogEntry::from_priority(TEMPLATE_FACILITY * 8 + severity, timestamp);
        entry.msg_id = tracking_id.to_string();
        entry.message = message.to_string();
        entry
    }
}

impl LogParser for TemplateParser {
    fn parse(&self, raw: &str) -> Result<LogEntry, ParseError> {
        if raw.is_empty() {
            return Err(ParseError::Empty);
        }
        match self.split(raw) {
            Some(values) => Ok(self.build_entry(values)),
            None => Ok(unknown_entry(raw)),
        }
    }
}

/// Fallback for lines that match no template shape: `UNKNOWN` level, raw
/// line preserved as the message.
fn unknown_entry(raw: &str) -> LogEntry {
    let severity = severity_for_level("UNKNOWN");
    let mut entry = LogEntry::from_priority(TEMPLATE_FACILITY * 8 + severity, Utc::now());
    entry.message = raw.to_string();
    entry
}

/// Trimmed, case-insensitive prefix match onto {DEBUG, INFO, WARN, ERROR,
/// FATAL}. Unrecognized non-empty input passes through uppercased; empty
/// input defaults to INFO.
pub fn normalize_level(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "INFO".to_string();
    }
    let upper = trimmed.to_ascii_uppercase();
    for known in ["DEBUG", "INFO", "WARN", "ERROR", "FATAL"] {
        if upper.starts_with(known) {
            return known.to_string();
        }
    }
    upper
}

/// Numeric syslog severity for a normalized level name.
pub fn severity_for_level(level: &str) -> u8 {
    match level {
        "DEBUG" => 7,
        "INFO" => 6,
        "WARN" => 4,
        "ERROR" => 3,
        "FATAL" => 2,
        _ => 6,
    }
}

/// Accepted timestamp shapes, tried in order; `None` when nothing matches
/// (the caller substitutes the current time).
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y/%m/%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    // "Mon DD HH:MM:SS" carries no year; assume the current one.
    let with_year = format!("{} {}", raw, Utc::now().year());
    NaiveDateTime::parse_from_str(&with_year, "%b %d %H:%M:%S %Y")
        .ok()
        .map(|naive| naive.and_utc())
}
