use super::Result;
use bytes::BytesMut;
use eyre::eyre;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::codec::Encoder;
use tracing::{debug, info};

use crate::codec::{Framing, HeaderFields, HeaderFormat, MessageEncoder, TaggedMessage};
use crate::context::{RunContext, SessionId};
use crate::transport::{Endpoint, Transport};

/// Priority used when the caller does not pick one
pub const DEFAULT_PRIORITY: u8 = 7;

/// Pause between datagrams to keep the subject's receive buffer from overflowing
pub const DATAGRAM_PACING: Duration = Duration::from_millis(10);

/// What the verifier must find in a sink for one stream
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExpectedDelivery {
    pub kind: String,
    pub session: SessionId,
    pub count: u32,
}

impl ExpectedDelivery {
    pub fn new(kind: impl Into<String>, session: SessionId, count: u32) -> Self {
        Self {
            kind: kind.into(),
            session,
            count,
        }
    }
}

/// Configuration of a message generator
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Where messages go
    pub endpoint: Endpoint,
    /// Messages per stream
    pub repeat: u32,
    /// Header layout
    pub header: HeaderFormat,
    /// Header field values
    pub fields: HeaderFields,
    /// Explicit framing; `None` uses octet counting for structured headers on
    /// stream sockets and no framing otherwise
    pub framing: Option<Framing>,
    /// Appended after every message
    pub terminator: String,
    /// Write records one byte at a time
    pub send_by_bytes: bool,
}

impl TransportConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            repeat: 100,
            header: HeaderFormat::Legacy,
            fields: HeaderFields::default(),
            framing: None,
            terminator: "\n".to_string(),
            send_by_bytes: false,
        }
    }

    /// Framing actually applied to records
    pub fn effective_framing(&self) -> Framing {
        match self.framing {
            Some(framing) => framing,
            None if self.header == HeaderFormat::Structured && self.endpoint.is_stream_socket() => {
                Framing::OctetCounting
            }
            None => Framing::None,
        }
    }
}

/// Produces tagged message streams over one transport
///
/// The generator is configured once and reused for any number of streams.
/// Session identifiers come from the `RunContext` handed to each call.
pub struct MessageGenerator {
    config: TransportConfig,
    transport: Transport,
    encoder: MessageEncoder,
    buffer: BytesMut,
}

impl MessageGenerator {
    pub fn new(config: TransportConfig) -> Self {
        let encoder = MessageEncoder::new(
            config.effective_framing(),
            config.terminator.clone(),
            config.endpoint.record_width(),
        );
        let transport = Transport::new(config.endpoint.clone(), config.send_by_bytes);
        Self {
            config,
            transport,
            encoder,
            buffer: BytesMut::new(),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Sends one stream at the default priority
    pub async fn send_stream(&mut self, ctx: &mut RunContext, kind: &str) -> Result<ExpectedDelivery> {
        self.send_stream_with_priority(ctx, kind, DEFAULT_PRIORITY).await
    }

    /// Sends `repeat` messages of `kind` tagged with a fresh session
    ///
    /// # Arguments
    /// * `ctx` - Run context supplying the session and tracking the flush flag
    /// * `kind` - Message kind; must not contain whitespace
    /// * `priority` - Syslog priority value
    ///
    /// # Returns
    /// * `Result<ExpectedDelivery>` - The tuple the sink must match
    pub async fn send_stream_with_priority(
        &mut self,
        ctx: &mut RunContext,
        kind: &str,
        priority: u8,
    ) -> Result<ExpectedDelivery> {
        if kind.is_empty() || kind.contains(char::is_whitespace) {
            return Err(eyre!("message kind '{}' must be a single non-empty word", kind));
        }
        if self.config.repeat == 0 {
            return Err(eyre!("repeat count must be at least 1"));
        }

        self.transport.open().await?;
        let label = self.transport.label().to_string();
        info!("generating {} messages of kind {} using transport {}", self.config.repeat, kind, label);

        ctx.mark_sent();
        let session = ctx.allocate_session();
        let datagram = self.config.endpoint.is_datagram();

        for sequence in 1..=self.config.repeat {
            let message = TaggedMessage {
                priority,
                kind,
                session,
                sequence,
                label: &label,
            };
            let text = message.render(self.config.header, &self.config.fields);

            self.buffer.clear();
            self.encoder.encode(text.as_str(), &mut self.buffer)?;
            self.transport.send(&self.buffer).await?;

            if datagram {
                sleep(DATAGRAM_PACING).await;
            }
        }

        debug!("session {} of kind {} sent", session, kind);
        Ok(ExpectedDelivery::new(kind, session, self.config.repeat))
    }

    /// Closes the underlying transport
    pub async fn close(&mut self) -> Result<()> {
        self.transport.close().await
    }
}
