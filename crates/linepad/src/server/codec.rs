//! Incremental framing of inbound units.
//!
//! [`EnvelopeCodec`] plugs into `tokio_util::codec::FramedRead`. It buffers
//! partial reads and yields exactly one item per `\n`-terminated unit, no
//! matter how the bytes were split across reads. A unit that fails to
//! decode becomes an `Err` *item*, not a stream error, so one bad unit
//! never tears the connection down.

use super::message::{decode_handshake, Envelope, SEPARATOR};
use crate::error::{HandshakeError, ProtocolError};
use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

/// Longest unit accepted before the codec starts discarding.
pub const DEFAULT_MAX_UNIT_LENGTH: usize = 64 * 1024;

/// One decoded inbound unit.
#[derive(Debug)]
pub enum Inbound {
    /// The first unit of a connection: the requested display name.
    Handshake(Result<String, HandshakeError>),
    /// Every later unit.
    Envelope(Result<Envelope, ProtocolError>),
}

/// Decoder for the line-delimited envelope protocol.
#[derive(Debug)]
pub struct EnvelopeCodec {
    /// Where the separator search resumes on the next call.
    next_index: usize,
    max_length: usize,
    /// Dropping the rest of an oversized unit.
    discarding: bool,
    awaiting_handshake: bool,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeCodec {
    /// A codec for a fresh server-side connection. The first unit is
    /// decoded as a handshake.
    pub fn new() -> Self {
        Self {
            next_index: 0,
            max_length: DEFAULT_MAX_UNIT_LENGTH,
            discarding: false,
            awaiting_handshake: true,
        }
    }

    /// Cap the length of a single unit. Longer units are dropped and
    /// reported as malformed.
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length.max(1);
        self
    }

    fn decode_unit(&mut self, unit: &[u8]) -> Inbound {
        if std::mem::take(&mut self.awaiting_handshake) {
            Inbound::Handshake(decode_handshake(unit))
        } else {
            Inbound::Envelope(Envelope::decode(unit))
        }
    }

    fn oversized(&mut self) -> Inbound {
        if std::mem::take(&mut self.awaiting_handshake) {
            Inbound::Handshake(Err(HandshakeError::Invalid))
        } else {
            Inbound::Envelope(Err(ProtocolError::malformed(format!(
                "unit exceeds {} bytes",
                self.max_length
            ))))
        }
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Inbound;
    type Error = ProtocolError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Inbound>, ProtocolError> {
        loop {
            let read_to = buf.len().min(self.max_length.saturating_add(1));
            let found = buf[self.next_index.min(read_to)..read_to]
                .iter()
                .position(|&b| b == SEPARATOR)
                .map(|offset| offset + self.next_index);

            match (self.discarding, found) {
                (true, Some(end)) => {
                    buf.advance(end + 1);
                    self.next_index = 0;
                    self.discarding = false;
                    return Ok(Some(self.oversized()));
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(end)) => {
                    let unit = buf.split_to(end + 1);
                    self.next_index = 0;
                    let mut unit = &unit[..end];
                    if let Some(stripped) = unit.strip_suffix(b"\r") {
                        unit = stripped;
                    }
                    if unit.is_empty() {
                        continue;
                    }
                    return Ok(Some(self.decode_unit(unit)));
                }
                (false, None) if buf.len() > self.max_length => {
                    self.discarding = true;
                    self.next_index = 0;
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Inbound>, ProtocolError> {
        match self.decode(buf)? {
            Some(item) => Ok(Some(item)),
            None => {
                if !buf.is_empty() {
                    tracing::debug!(
                        bytes = buf.len(),
                        "Dropping unterminated unit at end of stream"
                    );
                    buf.clear();
                }
                self.next_index = 0;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Operation;

    const INSERT_H: &str = concat!(
        r#"{"packet_type":"operation","#,
        r#""data":{"type":"insert","position":{"x":0,"y":0},"character":"h"}}"#
    );

    /// A codec past its handshake.
    fn established() -> EnvelopeCodec {
        let mut codec = EnvelopeCodec::new();
        codec.awaiting_handshake = false;
        codec
    }

    fn drain(codec: &mut EnvelopeCodec, buf: &mut BytesMut) -> Vec<Inbound> {
        let mut items = Vec::new();
        while let Some(item) = codec.decode(buf).unwrap() {
            items.push(item);
        }
        items
    }

    fn expect_envelope(item: Inbound) -> Envelope {
        match item {
            Inbound::Envelope(Ok(env)) => env,
            other => panic!("Expected envelope, got {other:?}"),
        }
    }

    #[test]
    fn test_first_unit_is_handshake() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from(format!("{{\"name\":\"alice\"}}\n{INSERT_H}\n").as_str());

        let items = drain(&mut codec, &mut buf);
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], Inbound::Handshake(Ok(name)) if name == "alice"));
        assert!(matches!(&items[1], Inbound::Envelope(Ok(Envelope::Operation(_)))));
    }

    #[test]
    fn test_partial_units_are_buffered() {
        let mut codec = established();
        let mut buf = BytesMut::new();

        // Zero bytes.
        assert!(codec.decode(&mut buf).unwrap().is_none());

        let (head, tail) = INSERT_H.split_at(20);
        buf.extend_from_slice(head.as_bytes());
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(tail.as_bytes());
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"\n");
        let env = expect_envelope(codec.decode(&mut buf).unwrap().unwrap());
        match env {
            Envelope::Operation(message) => {
                assert_eq!(message.operation, Operation::Insert { x: 0, y: 0, ch: 'h' })
            }
            other => panic!("Wrong envelope: {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_many_units_plus_trailing_partial() {
        let mut codec = established();
        let units = format!("{INSERT_H}\n{INSERT_H}\r\n\n{INSERT_H}\n{{\"packet");
        let mut buf = BytesMut::from(units.as_str());

        let items = drain(&mut codec, &mut buf);
        assert_eq!(items.len(), 3);
        assert_eq!(&buf[..], b"{\"packet");
    }

    #[test]
    fn test_malformed_unit_does_not_stop_stream() {
        let mut codec = established();
        let mut buf = BytesMut::from(format!("{{oops\n{INSERT_H}\n").as_str());

        let mut items = drain(&mut codec, &mut buf).into_iter();
        match items.next() {
            Some(Inbound::Envelope(Err(e))) => assert!(e.is_recoverable()),
            other => panic!("Expected malformed unit, got {other:?}"),
        }
        expect_envelope(items.next().unwrap());
        assert!(items.next().is_none());
    }

    #[test]
    fn test_oversized_unit_is_discarded() {
        let mut codec = established().with_max_length(24);
        let mut buf = BytesMut::from("x".repeat(40).as_str());

        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"yyyy\n");
        buf.extend_from_slice(br#"{"packet_type":"x"}"#);
        buf.extend_from_slice(b"\n");

        let mut items = drain(&mut codec, &mut buf).into_iter();
        assert!(matches!(items.next(), Some(Inbound::Envelope(Err(_)))));
        let env = expect_envelope(items.next().unwrap());
        assert!(matches!(env, Envelope::Unknown { .. }));
    }

    #[test]
    fn test_eof_drops_unterminated_unit() {
        let mut codec = established();
        let mut buf = BytesMut::from("{\"packet_type\":");
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }
}
