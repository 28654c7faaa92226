//! Correctness oracle for a log transport pipeline.
//!
//! Drives a log-processing daemon (the subject) through its lifecycle,
//! pushes sequenced messages into it over sockets, files or pipes, and checks
//! that every message reached the configured sinks exactly once and in order
//! within its session.
//!
//! A typical run:
//! 1. [`DaemonController::start`] with a configuration
//! 2. [`MessageGenerator::send_stream`] once per message kind, collecting
//!    [`ExpectedDelivery`] tuples
//! 3. [`verifier::check`] (flushes the subject, then scans the sink)
//! 4. [`DaemonController::stop`]

pub type Result<T> = color_eyre::eyre::Result<T>;

pub mod codec;
pub mod context;
pub mod controller;
pub mod generator;
pub mod sink;
pub mod transport;
pub mod verifier;

pub use codec::{Framing, HeaderFields, HeaderFormat};
pub use context::{RunContext, SessionId};
pub use controller::{ControllerConfig, DaemonController, SubjectProcess, SubjectSignal, SubjectState};
pub use generator::{ExpectedDelivery, MessageGenerator, TransportConfig};
pub use sink::{SinkDescriptor, SinkReader};
pub use transport::{Endpoint, TlsOptions, Transport};
pub use verifier::{Discrepancy, MalformedLinePolicy, ObservedIndex, ScanOptions, Verdict};
