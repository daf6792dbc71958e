//! Raw line → structured entry conversion.
//!
//! Two parser variants exist: a strict/lenient RFC5424 parser and a
//! pluggable template parser for pipe-delimited application logs. The
//! ingestion pipeline composes them behind a single-line byte heuristic:
//! a `<digits>` priority prefix routes the line to the RFC5424 parser,
//! everything else goes through the configured template.

pub mod rfc5424;
pub mod template;

use crate::error::ParseError;
use crate::model::LogEntry;

pub use rfc5424::Rfc5424Parser;
pub use template::TemplateParser;

/// Trait for log parsers.
pub trait LogParser: Send + Sync {
    /// Parse a raw log line into a structured entry.
    fn parse(&self, raw: &str) -> Result<LogEntry, ParseError>;
}

/// Fast single-line check for a syslog `<PRI>` prefix (no allocation).
/// PRI is 1-3 digits, so the closing `>` must appear within the first
/// five bytes.
pub fn looks_like_syslog(line: &str) -> bool {
    let bytes = line.as_bytes();
    if bytes.first() != Some(&b'<') {
        return false;
    }
    match bytes.iter().take(5).position(|&b| b == b'>') {
        Some(end) if end > 1 => bytes[1..end].iter().all(u8::is_ascii_digit),
        _ => false,
    }
}

/// The parser used by the ingestion pipeline: RFC5424 (lenient) for lines
/// with a priority prefix, the configured template for everything else.
pub struct PipelineParser {
    syslog: Rfc5424Parser,
    template: TemplateParser,
}

impl PipelineParser {
    pub fn new(template: TemplateParser) -> Self {
        Self {
            syslog: Rfc5424Parser::lenient(),
            template,
        }
    }
}

impl LogParser for PipelineParser {
    fn parse(&self, raw: &str) -> Result<LogEntry, ParseError> {
        if raw.is_empty() {
            return Err(ParseError::Empty);
        }
        if looks_like_syslog(raw) {
            self.syslog.parse(raw)
        } else {
            self.template.parse(raw)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syslog_prefix_detection() {
        assert!(looks_like_syslog("<165>1 2023-10-15T14:30:45Z host app - - - hi"));
        assert!(looks_like_syslog("<0>1 - - - - - -"));
        assert!(!looks_like_syslog("2024-01-01T10:00:00Z|INFO|u1|hello"));
        assert!(!looks_like_syslog("<>1 no digits"));
        assert!(!looks_like_syslog("<abc>1 not numeric"));
        assert!(!looks_like_syslog(""));
    }

    #[test]
    fn pipeline_routes_by_prefix() {
        let parser = PipelineParser::new(
            TemplateParser::new("{{timestamp}}|{{level}}|{{tracking_id}}|{{message}}").unwrap(),
        );

        let syslog = parser
            .parse("<165>1 2023-10-15T14:30:45.123Z web01 nginx 1234 access - User login successful")
            .unwrap();
        assert_eq!(syslog.hostname, "web01");

        let templated = parser
            .parse("2024-01-01T10:00:00Z|INFO|u1|User logged in")
            .unwrap();
        assert_eq!(templated.msg_id, "u1");
        assert_eq!(templated.message, "User logged in");

        assert!(matches!(parser.parse(""), Err(ParseError::Empty)));
    }
}
