//! Tagged message format shared by the generator and the verifier.
//!
//! A tagged message looks like
//! `<pri>HEADER <kind> <session>/<sequence> <transport> <padding>` where the
//! header is either the legacy BSD style or the structured (version 1) style.
//! The verifier only relies on the `<kind> <session>/<sequence>` part that
//! follows the header prefix.

use bytes::BytesMut;
use chrono::{DateTime, FixedOffset, SecondsFormat};
use once_cell::sync::Lazy;
use regex::Regex;
use std::io;
use tokio_util::codec::Encoder;

use crate::context::SessionId;

/// Number of padding characters appended to every message
pub const PADDING_LEN: usize = 250;

static DEFAULT_TIMESTAMP: Lazy<DateTime<FixedOffset>> = Lazy::new(|| {
    DateTime::parse_from_rfc3339("2004-09-07T10:43:21+01:00").expect("timestamp literal is valid")
});

static PAYLOAD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^ (\S+) (\d+)/(\d+)").expect("payload pattern is valid"));

/// Header layout of generated messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderFormat {
    /// `TIMESTAMP HOST PROGRAM[PID]:`
    #[default]
    Legacy,
    /// `1 TIMESTAMP HOST PROGRAM PID - -`
    Structured,
}

/// Fixed fields rendered into every header
#[derive(Debug, Clone)]
pub struct HeaderFields {
    pub timestamp: DateTime<FixedOffset>,
    pub host: String,
    pub program: String,
    pub pid: u32,
}

impl Default for HeaderFields {
    fn default() -> Self {
        Self {
            timestamp: *DEFAULT_TIMESTAMP,
            host: "bzorp".to_string(),
            program: "prog".to_string(),
            pid: 12345,
        }
    }
}

impl HeaderFields {
    fn timestamp_text(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, false)
    }
}

impl HeaderFormat {
    /// Returns the header text that follows the priority (and version marker)
    ///
    /// This is also the prefix a sink line is expected to start with when the
    /// subject writes messages back out with an ISO timestamp template.
    pub fn prefix(self, fields: &HeaderFields) -> String {
        match self {
            HeaderFormat::Legacy => format!(
                "{} {} {}[{}]:",
                fields.timestamp_text(),
                fields.host,
                fields.program,
                fields.pid
            ),
            HeaderFormat::Structured => format!(
                "{} {} {} {} - -",
                fields.timestamp_text(),
                fields.host,
                fields.program,
                fields.pid
            ),
        }
    }

    fn version_marker(self) -> &'static str {
        match self {
            HeaderFormat::Legacy => "",
            HeaderFormat::Structured => "1 ",
        }
    }
}

/// One message of a stream before it is framed for the wire
#[derive(Debug, Clone, Copy)]
pub struct TaggedMessage<'a> {
    pub priority: u8,
    pub kind: &'a str,
    pub session: SessionId,
    pub sequence: u32,
    /// Transport description embedded into the payload
    pub label: &'a str,
}

impl TaggedMessage<'_> {
    /// Renders the message text without framing or terminator
    pub fn render(&self, format: HeaderFormat, fields: &HeaderFields) -> String {
        format!(
            "<{}>{}{} {} {:03}/{:05} {} {}",
            self.priority,
            format.version_marker(),
            format.prefix(fields),
            self.kind,
            self.session,
            self.sequence,
            self.label,
            "x".repeat(PADDING_LEN)
        )
    }
}

/// Extracts `(kind, session, sequence)` from the text following the header prefix
///
/// The text must start with a single space, as it does right after a prefix.
pub fn parse_payload(rest: &str) -> Option<(&str, SessionId, u32)> {
    let caps = PAYLOAD_RE.captures(rest)?;
    let kind = caps.get(1)?.as_str();
    let session = caps.get(2)?.as_str().parse().ok()?;
    let sequence = caps.get(3)?.as_str().parse().ok()?;
    Some((kind, session, sequence))
}

/// Message framing applied on stream transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// Messages are delimited by the terminator only
    #[default]
    None,
    /// Each message is preceded by its byte length and a space
    OctetCounting,
}

/// Turns rendered messages into wire records
///
/// Applies framing, then the terminator, then optional NUL padding up to a
/// fixed record width. Records already longer than the width are left as is.
#[derive(Debug, Clone)]
pub struct MessageEncoder {
    framing: Framing,
    terminator: Vec<u8>,
    record_width: Option<usize>,
}

impl MessageEncoder {
    pub fn new(framing: Framing, terminator: impl Into<Vec<u8>>, record_width: Option<usize>) -> Self {
        Self {
            framing,
            terminator: terminator.into(),
            record_width,
        }
    }
}

impl Encoder<&str> for MessageEncoder {
    type Error = io::Error;

    fn encode(&mut self, line: &str, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        if self.framing == Framing::OctetCounting {
            dst.extend_from_slice(format!("{} ", line.len()).as_bytes());
        }
        dst.extend_from_slice(line.as_bytes());
        dst.extend_from_slice(&self.terminator);

        if let Some(width) = self.record_width {
            if dst.len() - start < width {
                dst.resize(start + width, 0);
            }
        }
        Ok(())
    }
}
