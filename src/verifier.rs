use super::Result;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::codec::{parse_payload, HeaderFields, HeaderFormat};
use crate::context::{RunContext, SessionId};
use crate::controller::DaemonController;
use crate::generator::ExpectedDelivery;
use crate::sink::{SinkDescriptor, SinkReader};

/// A specific reason a sink does not match expectations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Discrepancy {
    #[error("sink {sink} could not be read: {reason}")]
    SinkUnreadable { sink: String, reason: String },

    #[error("message does not start with prefix '{prefix}', sink={sink}:{line_no}, line={line}")]
    PrefixMismatch {
        sink: String,
        line_no: usize,
        prefix: String,
        line: String,
    },

    #[error("message payload has unexpected format, sink={sink}:{line_no}, line={line}")]
    MalformedPayload {
        sink: String,
        line_no: usize,
        line: String,
    },

    #[error("the id of the first message in a session is not 1, kind={kind}, session={session}, id={sequence}, sink={sink}:{line_no}, line={line}")]
    FirstSequenceNotOne {
        sink: String,
        line_no: usize,
        kind: String,
        session: SessionId,
        sequence: u32,
        line: String,
    },

    #[error("message reordering/drop detected in the same session, kind={kind}, session={session}, id={actual}, expected_id={expected}, sink={sink}:{line_no}, line={line}")]
    SequenceBreak {
        sink: String,
        line_no: usize,
        kind: String,
        session: SessionId,
        expected: u32,
        actual: u32,
        line: String,
    },

    #[error("well-formed message after trailing noise starting at line {noise_line_no}, sink={sink}:{line_no}, line={line}")]
    DataAfterNoise {
        sink: String,
        noise_line_no: usize,
        line_no: usize,
        line: String,
    },

    #[error("output lacks this kind of message: {kind} session: {session}, count: {count}")]
    MissingSession {
        kind: String,
        session: SessionId,
        count: u32,
    },

    #[error("not enough messages found, kind: {kind}, session: {session}, last_id: {observed}, count: {expected}")]
    Shortfall {
        kind: String,
        session: SessionId,
        expected: u32,
        observed: u32,
    },

    #[error("more messages than sent, kind: {kind}, session: {session}, last_id: {observed}, count: {expected}")]
    Excess {
        kind: String,
        session: SessionId,
        expected: u32,
        observed: u32,
    },

    #[error("output contains more messages than expected: {}", format_extras(.extras))]
    UnexpectedMessages { extras: Vec<(String, SessionId, u32)> },
}

fn format_extras(extras: &[(String, SessionId, u32)]) -> String {
    extras
        .iter()
        .map(|(kind, session, last)| format!("{} session {} (last id {})", kind, session, last))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Outcome of checking a sink
pub type Verdict = std::result::Result<(), Discrepancy>;

/// What to do with lines that fail the prefix or payload grammar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MalformedLinePolicy {
    /// The first malformed line fails the scan
    #[default]
    Strict,
    /// A malformed line starts trailing noise; a well-formed line after it fails the scan
    TolerateTrailing,
    /// Malformed lines are logged and skipped
    SkipMalformed,
}

/// How sink lines are matched
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Text every line must start with after `skip_prefix` bytes
    pub prefix: String,
    /// Leading bytes ignored on every line
    pub skip_prefix: usize,
    pub policy: MalformedLinePolicy,
}

impl ScanOptions {
    /// Options matching lines written back with the given header format
    pub fn for_header(format: HeaderFormat, fields: &HeaderFields) -> Self {
        Self {
            prefix: format.prefix(fields),
            ..Default::default()
        }
    }
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            prefix: HeaderFormat::Legacy.prefix(&HeaderFields::default()),
            skip_prefix: 0,
            policy: MalformedLinePolicy::Strict,
        }
    }
}

/// Highest contiguous sequence seen per (kind, session)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedIndex {
    last_seen: BTreeMap<(String, SessionId), u32>,
}

impl ObservedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: &str, session: SessionId) -> Option<u32> {
        self.last_seen.get(&(kind.to_string(), session)).copied()
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, SessionId, u32)> {
        self.last_seen
            .iter()
            .map(|((kind, session), last)| (kind.as_str(), *session, *last))
    }

    /// Records one occurrence, enforcing that it extends the pair by exactly one
    ///
    /// # Returns
    /// * `Err(None)` - First occurrence of the pair is not 1
    /// * `Err(Some(expected))` - Occurrence is not the previous one plus one
    fn advance(&mut self, kind: &str, session: SessionId, sequence: u32) -> std::result::Result<(), Option<u32>> {
        let key = (kind.to_string(), session);
        match self.last_seen.get(&key) {
            None if sequence != 1 => return Err(None),
            Some(&last) if last.checked_add(1) != Some(sequence) => {
                return Err(Some(last.saturating_add(1)));
            }
            _ => {}
        }
        self.last_seen.insert(key, sequence);
        Ok(())
    }
}

impl FromIterator<(String, SessionId, u32)> for ObservedIndex {
    fn from_iter<T: IntoIterator<Item = (String, SessionId, u32)>>(iter: T) -> Self {
        Self {
            last_seen: iter
                .into_iter()
                .map(|(kind, session, last)| ((kind, session), last))
                .collect(),
        }
    }
}

enum LineFault {
    Prefix,
    Payload,
}

fn parse_line<'a>(line: &'a str, options: &ScanOptions) -> std::result::Result<(&'a str, SessionId, u32), LineFault> {
    let body = line.get(options.skip_prefix..).ok_or(LineFault::Prefix)?;
    let rest = body.strip_prefix(options.prefix.as_str()).ok_or(LineFault::Prefix)?;
    parse_payload(rest).ok_or(LineFault::Payload)
}

/// Reads a sink to the end and builds its observed index
///
/// Any (kind, session) pair must start at 1 and grow by exactly one per
/// line; the first violation stops the scan. Different pairs may interleave
/// freely. Blank lines are ignored but counted.
pub async fn scan_sink(reader: &mut dyn SinkReader, options: &ScanOptions) -> std::result::Result<ObservedIndex, Discrepancy> {
    let sink = reader.name().to_string();
    info!("Starting output content check of {}", sink);

    let mut index = ObservedIndex::new();
    let mut line_no = 0usize;
    let mut noise_start: Option<usize> = None;
    let mut skipped = 0usize;

    loop {
        let raw = match reader.next_line().await {
            Ok(Some(raw)) => raw,
            Ok(None) => break,
            Err(e) => {
                return Err(Discrepancy::SinkUnreadable {
                    sink,
                    reason: format!("read failed after line {}: {}", line_no, e),
                })
            }
        };
        line_no += 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        let (kind, session, sequence) = match parse_line(line, options) {
            Ok(parsed) => parsed,
            Err(fault) => {
                match options.policy {
                    MalformedLinePolicy::Strict => {
                        return Err(match fault {
                            LineFault::Prefix => Discrepancy::PrefixMismatch {
                                sink,
                                line_no,
                                prefix: options.prefix.clone(),
                                line: line.to_string(),
                            },
                            LineFault::Payload => Discrepancy::MalformedPayload {
                                sink,
                                line_no,
                                line: line.to_string(),
                            },
                        });
                    }
                    MalformedLinePolicy::TolerateTrailing => {
                        if noise_start.is_none() {
                            warn!("trailing noise starts at {}:{}", sink, line_no);
                            noise_start = Some(line_no);
                        }
                    }
                    MalformedLinePolicy::SkipMalformed => {
                        warn!("skipping malformed line {}:{}: {}", sink, line_no, line);
                        skipped += 1;
                    }
                }
                continue;
            }
        };

        if let Some(noise_line_no) = noise_start {
            return Err(Discrepancy::DataAfterNoise {
                sink,
                noise_line_no,
                line_no,
                line: line.to_string(),
            });
        }

        match index.advance(kind, session, sequence) {
            Ok(()) => {}
            Err(None) => {
                return Err(Discrepancy::FirstSequenceNotOne {
                    sink,
                    line_no,
                    kind: kind.to_string(),
                    session,
                    sequence,
                    line: line.to_string(),
                })
            }
            Err(Some(expected)) => {
                return Err(Discrepancy::SequenceBreak {
                    sink,
                    line_no,
                    kind: kind.to_string(),
                    session,
                    expected,
                    actual: sequence,
                    line: line.to_string(),
                })
            }
        }
    }

    if skipped > 0 {
        warn!("{} malformed lines skipped in {}", skipped, sink);
    }
    info!("scanned {} lines of {}, {} sessions seen", line_no, sink, index.len());
    Ok(index)
}

/// Compares an observed index with the expected deliveries
///
/// Each expected tuple consumes its pair; a missing pair or a last id that
/// differs from the count fails, and so do pairs left over at the end. The
/// inputs are not modified.
pub fn verify(observed: &ObservedIndex, expected: &[ExpectedDelivery]) -> Verdict {
    let mut remaining = observed.last_seen.clone();

    for delivery in expected {
        let key = (delivery.kind.clone(), delivery.session);
        let Some(last) = remaining.remove(&key) else {
            return Err(Discrepancy::MissingSession {
                kind: delivery.kind.clone(),
                session: delivery.session,
                count: delivery.count,
            });
        };
        if last < delivery.count {
            return Err(Discrepancy::Shortfall {
                kind: delivery.kind.clone(),
                session: delivery.session,
                expected: delivery.count,
                observed: last,
            });
        }
        if last > delivery.count {
            return Err(Discrepancy::Excess {
                kind: delivery.kind.clone(),
                session: delivery.session,
                expected: delivery.count,
                observed: last,
            });
        }
    }

    if !remaining.is_empty() {
        return Err(Discrepancy::UnexpectedMessages {
            extras: remaining
                .into_iter()
                .map(|((kind, session), last)| (kind, session, last))
                .collect(),
        });
    }
    Ok(())
}

/// Opens, scans and verifies one sink without flushing the subject
pub async fn check_sink(sink: &SinkDescriptor, expected: &[ExpectedDelivery], options: &ScanOptions) -> Verdict {
    let mut reader = sink.open().await?;
    let observed = scan_sink(reader.as_mut(), options).await?;
    verify(&observed, expected)
}

/// Flushes the subject, then checks one sink against the expected deliveries
///
/// # Returns
/// * `Result<Verdict>` - Err only if the flush could not be performed
pub async fn check(
    controller: &mut DaemonController,
    ctx: &mut RunContext,
    sink: &SinkDescriptor,
    expected: &[ExpectedDelivery],
    settle_time: Duration,
    options: &ScanOptions,
) -> Result<Verdict> {
    info!("Checking contents of output {}", sink);
    controller.flush(ctx, settle_time).await?;
    let verdict = check_sink(sink, expected, options).await;
    report(sink, &verdict);
    Ok(verdict)
}

/// Flushes once, then checks every sink independently; all must pass
///
/// Every sink is checked and logged even after a failure; the first failing
/// verdict is returned.
pub async fn check_all(
    controller: &mut DaemonController,
    ctx: &mut RunContext,
    sinks: &[SinkDescriptor],
    expected: &[ExpectedDelivery],
    settle_time: Duration,
    options: &ScanOptions,
) -> Result<Verdict> {
    controller.flush(ctx, settle_time).await?;

    let mut outcome = Ok(());
    for sink in sinks {
        info!("Checking contents of output {}", sink);
        let verdict = check_sink(sink, expected, options).await;
        report(sink, &verdict);
        if outcome.is_ok() {
            outcome = verdict;
        }
    }
    Ok(outcome)
}

fn report(sink: &SinkDescriptor, verdict: &Verdict) {
    match verdict {
        Ok(()) => info!("{} matches expected deliveries", sink),
        Err(discrepancy) => error!("{} failed verification: {}", sink, discrepancy),
    }
}
