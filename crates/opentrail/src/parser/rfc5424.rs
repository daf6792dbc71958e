//! RFC5424 syslog parser.
//!
//! Accepts `<PRI>VER SP TIMESTAMP SP HOSTNAME SP APP-NAME SP PROCID SP
//! MSGID SP STRUCTURED-DATA [SP MSG]`. Strict mode rejects anything that
//! deviates; lenient mode recovers every non-empty failure into a
//! synthetic local0/info entry carrying the raw line as its message.

use chrono::{DateTime, Utc};

use super::LogParser;
use crate::error::ParseError;
use crate::model::{LogEntry, StructuredData};

/// Priority synthesized by lenient recovery: facility 16 (local0),
/// severity 6 (info).
const FALLBACK_PRIORITY: u8 = 134;

pub struct Rfc5424Parser {
    lenient: bool,
}

impl Rfc5424Parser {
    pub fn strict() -> Self {
        Self { lenient: false }
    }

    pub fn lenient() -> Self {
        Self { lenient: true }
    }

    fn parse_strict(&self, raw: &str) -> Result<LogEntry, ParseError> {
        let rest = raw
            .strip_prefix('<')
            .ok_or_else(|| ParseError::MalformedPriority("missing '<'".to_string()))?;
        let (pri_str, rest) = rest
            .split_once('>')
            .ok_or_else(|| ParseError::MalformedPriority("missing '>'".to_string()))?;

        if pri_str.is_empty()
            || pri_str.len() > 3
            || !pri_str.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(ParseError::MalformedPriority(pri_str.to_string()));
        }
        let priority: u16 = pri_str
            .parse()
            .map_err(|_| ParseError::MalformedPriority(pri_str.to_string()))?;
        if priority > 191 {
            return Err(ParseError::MalformedPriority(format!(
                "{} out of range 0..=191",
                priority
            )));
        }

        let (version, rest) = take_token(rest)?;
        if version != "1" {
            return Err(ParseError::MalformedHeader(format!(
                "unsupported version {:?}",
                version
            )));
        }

        let (ts_token, rest) = take_token(rest)?;
        let timestamp = parse_timestamp(ts_token)?;

        let (hostname, rest) = take_token(rest)?;
        let (app_name, rest) = take_token(rest)?;
        let (proc_id, rest) = take_token(rest)?;
        let (msg_id, rest) = take_token(rest)?;

        let (structured_data, message) = parse_structured_data(rest)?;

        let mut entry = LogEntry::from_priority(priority as u8, timestamp);
        entry.hostname = nil_to_empty(hostname);
        entry.app_name = nil_to_empty(app_name);
        entry.proc_id = nil_to_empty(proc_id);
        entry.msg_id = nil_to_empty(msg_id);
        entry.structured_data = structured_data;
        entry.message = message;
        Ok(entry)
    }
}

impl LogParser for Rfc5424Parser {
    fn parse(&self, raw: &str) -> Result<LogEntry, ParseError> {
        if raw.is_empty() {
            return Err(ParseError::Empty);
        }
        match self.parse_strict(raw) {
            Ok(entry) => Ok(entry),
            Err(_) if self.lenient => {
                let mut entry = LogEntry::from_priority(FALLBACK_PRIORITY, Utc::now());
                entry.message = raw.to_string();
                Ok(entry)
            }
            Err(e) => Err(e),
        }
    }
}

/// Next space-delimited token. The final token may not be followed by a
/// space, in which case the remainder is empty.
fn take_token(input: &str) -> Result<(&str, &str), ParseError> {
    if input.is_empty() {
        return Err(ParseError::MalformedHeader("truncated header".to_string()));
    }
    match input.split_once(' ') {
        Some((token, rest)) => Ok((token, rest)),
        None => Ok((input, "")),
    }
}

fn nil_to_empty(token: &str) -> String {
    if token == "-" {
        String::new()
    } else {
        token.to_string()
    }
}

/// TIMESTAMP is either NIL (current time) or RFC3339 with any fractional
/// precision and either `Z` or a numeric offset.
fn parse_timestamp(token: &str) -> Result<DateTime<Utc>, ParseError> {
    if token == "-" {
        return Ok(Utc::now());
    }
    DateTime::parse_from_rfc3339(token)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ParseError::MalformedHeader(format!("timestamp {:?}", token)))
}

/// STRUCTURED-DATA = NILVALUE / 1*SD-ELEMENT, followed by the optional
/// message. When two SD-ELEMENTs carry the same SD-ID the later group's
/// parameter map replaces the earlier one wholesale (preserved source
/// behavior).
fn parse_structured_data(input: &str) -> Result<(StructuredData, String), ParseError> {
    let mut sd = StructuredData::new();

    if let Some(rest) = input.strip_prefix('-') {
        let message = split_message(rest)?;
        return Ok((sd, message));
    }

    if !input.starts_with('[') {
        return Err(ParseError::MalformedHeader(
            "structured data must be '-' or bracketed".to_string(),
        ));
    }

    let mut rest = input;
    while let Some(body) = rest.strip_prefix('[') {
        let (sd_id, params, remaining) = parse_sd_element(body)?;
        sd.insert(sd_id, params);
        rest = remaining;
    }

    let message = split_message(rest)?;
    Ok((sd, message))
}

/// After the SD section either the line ends or a single space separates
/// the free-form message.
fn split_message(rest: &str) -> Result<String, ParseError> {
    if rest.is_empty() {
        return Ok(String::new());
    }
    let message = rest.strip_prefix(' ').ok_or_else(|| {
        ParseError::MalformedHeader("expected space before message".to_string())
    })?;
    // RFC5424 permits a BOM at the start of MSG.
    Ok(message.strip_prefix('\u{FEFF}').unwrap_or(message).to_string())
}

/// Parse one SD-ELEMENT body (the leading `[` already consumed). Returns
/// the SD-ID, its parameter map, and the remainder after the closing `]`.
fn parse_sd_element(
    input: &str,
) -> Result<(String, std::collections::HashMap<String, String>, &str), ParseError> {
    let id_end = input
        .find(|c| c == ' ' || c == ']')
        .ok_or_else(|| ParseError::MalformedHeader("unterminated SD element".to_string()))?;
    let sd_id = &input[..id_end];
    if sd_id.is_empty() || sd_id.contains(['=', '"']) {
        return Err(ParseError::MalformedHeader(format!("bad SD-ID {:?}", sd_id)));
    }

    let mut params = std::collections::HashMap::new();
    let mut rest = &input[id_end..];

    loop {
        rest = rest.trim_start_matches(' ');
        if let Some(after) = rest.strip_prefix(']') {
            return Ok((sd_id.to_string(), params, after));
        }
        if rest.is_empty() {
            return Err(ParseError::MalformedHeader(
                "unterminated SD element".to_string(),
            ));
        }

        let eq = rest.find('=').ok_or_else(|| {
            ParseError::MalformedHeader("SD param missing '='".to_string())
        })?;
        let name = &rest[..eq];
        if name.is_empty() || name.contains([' ', ']', '"']) {
            return Err(ParseError::MalformedHeader(format!(
                "bad SD param name {:?}",
                name
            )));
        }
        let after_eq = &rest[eq + 1..];
        let value_body = after_eq.strip_prefix('"').ok_or_else(|| {
            ParseError::MalformedHeader("SD param value must be quoted".to_string())
        })?;

        let (value, remaining) = scan_quoted_value(value_body)?;
        params.insert(name.to_string(), value);
        rest = remaining;
    }
}

/// Scan a quoted PARAM-VALUE up to its unescaped closing quote, unescaping
/// `\"`, `\\`, and `\]` on the way (RFC5424 §6.3.3). Unknown escape
/// sequences keep the backslash verbatim.
fn scan_quoted_value(input: &str) -> Result<(String, &str), ParseError> {
    let mut value = String::new();
    let mut chars = input.char_indices();

    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((value, &input[i + 1..])),
            '\\' => match chars.next() {
                Some((_, next @ ('"' | '\\' | ']'))) => value.push(next),
                Some((_, other)) => {
                    value.push('\\');
                    value.push(other);
                }
                None => {
                    return Err(ParseError::MalformedHeader(
                        "unterminated escape in SD value".to_string(),
                    ))
                }
            },
            other => value.push(other),
        }
    }

    Err(ParseError::MalformedHeader(
        "unterminated SD param value".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ParseError;

    #[test]
    fn parses_full_message() {
        let parser = Rfc5424Parser::strict();
        let entry = parser
            .parse("<165>1 2023-10-15T14:30:45.123Z web01 nginx 1234 access - User login successful")
            .unwrap();

        assert_eq!(entry.priority, 165);
        assert_eq!(entry.facility, 20);
        assert_eq!(entry.severity, 5);
        assert_eq!(entry.version, 1);
        assert_eq!(entry.hostname, "web01");
        assert_eq!(entry.app_name, "nginx");
        assert_eq!(entry.proc_id, "1234");
        assert_eq!(entry.msg_id, "access");
        assert!(entry.structured_data.is_empty());
        assert_eq!(entry.message, "User login successful");
        assert_eq!(entry.timestamp.to_rfc3339(), "2023-10-15T14:30:45.123+00:00");
    }

    #[test]
    fn nil_fields_map_to_empty_strings() {
        let parser = Rfc5424Parser::strict();
        let entry = parser.parse("<34>1 2003-10-11T22:14:15Z - - - - -").unwrap();
        assert_eq!(entry.hostname, "");
        assert_eq!(entry.app_name, "");
        assert_eq!(entry.proc_id, "");
        assert_eq!(entry.msg_id, "");
        assert_eq!(entry.message, "");
    }

    #[test]
    fn nil_timestamp_means_now() {
        let before = Utc::now();
        let entry = Rfc5424Parser::strict()
            .parse("<34>1 - host app 1 id - hello")
            .unwrap();
        let after = Utc::now();
        assert!(entry.timestamp >= before && entry.timestamp <= after);
    }

    #[test]
    fn accepts_timestamp_variants() {
        let parser = Rfc5424Parser::strict();
        for ts in [
            "2023-10-15T14:30:45.123456789Z",
            "2023-10-15T14:30:45.123Z",
            "2023-10-15T14:30:45Z",
            "2023-10-15T14:30:45+02:00",
        ] {
            let line = format!("<13>1 {} host app - - - msg", ts);
            assert!(parser.parse(&line).is_ok(), "rejected {}", ts);
        }
    }

    #[test]
    fn parses_structured_data_groups() {
        let parser = Rfc5424Parser::strict();
        let entry = parser
            .parse(concat!(
                "<165>1 2003-10-11T22:14:15.003Z mymachine evntslog - ID47 ",
                "[exampleSDID@32473 iut=\"3\" eventSource=\"Application\" eventID=\"1011\"]",
                "[examplePriority@32473 class=\"high\"] An application event"
            ))
            .unwrap();

        let first = &entry.structured_data["exampleSDID@32473"];
        assert_eq!(first["iut"], "3");
        assert_eq!(first["eventSource"], "Application");
        assert_eq!(first["eventID"], "1011");
        assert_eq!(entry.structured_data["examplePriority@32473"]["class"], "high");
        assert_eq!(entry.message, "An application event");
    }

    #[test]
    fn unescapes_sd_param_values() {
        let entry = Rfc5424Parser::strict()
            .parse(r#"<165>1 2003-10-11T22:14:15Z h a - - [x@1 k="a\"b\\c\]d"] m"#)
            .unwrap();
        assert_eq!(entry.structured_data["x@1"]["k"], r#"a"b\c]d"#);
    }

    #[test]
    fn duplicate_sd_ids_keep_the_last_group() {
        let entry = Rfc5424Parser::strict()
            .parse(r#"<13>1 2003-10-11T22:14:15Z h a - - [dup@1 a="1" b="2"][dup@1 c="3"] m"#)
            .unwrap();
        let group = &entry.structured_data["dup@1"];
        assert_eq!(group.len(), 1);
        assert_eq!(group["c"], "3");
    }

    #[test]
    fn strict_mode_rejects_bad_headers() {
        let parser = Rfc5424Parser::strict();
        assert!(matches!(
            parser.parse("<192>1 2003-10-11T22:14:15Z h a - - - m"),
            Err(ParseError::MalformedPriority(_))
        ));
        assert!(matches!(
            parser.parse("<13>2 2003-10-11T22:14:15Z h a - - - m"),
            Err(ParseError::MalformedHeader(_))
        ));
        assert!(matches!(
            parser.parse("<13>1 not-a-timestamp h a - - - m"),
            Err(ParseError::MalformedHeader(_))
        ));
        assert!(matches!(
            parser.parse("plain text"),
            Err(ParseError::MalformedPriority(_))
        ));
    }

    #[test]
    fn lenient_mode_synthesizes_fallback_entry() {
        let parser = Rfc5424Parser::lenient();
        let entry = parser.parse("<999>garbage that is not syslog").unwrap();
        assert_eq!(entry.priority, 134);
        assert_eq!(entry.facility, 16);
        assert_eq!(entry.severity, 6);
        assert_eq!(entry.version, 1);
        assert_eq!(entry.message, "<999>garbage that is not syslog");
    }

    #[test]
    fn empty_input_fails_even_in_lenient_mode() {
        assert!(matches!(
            Rfc5424Parser::lenient().parse(""),
            Err(ParseError::Empty)
        ));
    }

    #[test]
    fn strips_bom_from_message() {
        let entry = Rfc5424Parser::strict()
            .parse("<13>1 2003-10-11T22:14:15Z h a - - - \u{FEFF}BOM message")
            .unwrap();
        assert_eq!(entry.message, "BOM message");
    }
}
