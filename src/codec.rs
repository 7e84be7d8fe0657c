//! The duplex codec: context-sensitive decode of server packets and
//! envelope-framed encode of client messages.
//!
//! Interpretation of a packet depends on where the conversation is, so
//! the codec keeps a decode mode that both decoded server messages and
//! outbound client commands drive forward.

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::context::ConnectionContext;
use crate::envelope::{EnvelopeSlicer, PacketAssembler, write_envelopes};
use crate::error::{Error, Result};
use crate::messages::server::{
    RowPacket, decode_auth_switch, decode_column_definition, decode_eof, decode_err,
    decode_greeting, decode_local_infile, decode_ok, decode_prepared_ok, decode_result_terminator,
};
use crate::messages::{ClientMessage, ServerMessage, contiguous};

/// What follows the metadata block currently streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterMetadata {
    /// A query or execute result: rows follow.
    Rows,
    /// A prepare reply: the metadata block is the whole response.
    Done,
}

/// Decode mode, advanced by both directions of traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeContext {
    /// Awaiting the server's opening greeting.
    Greeting,
    /// Handshake response sent; OK, ERR or an auth round-trip follows.
    AuthReply,
    /// Idle, or awaiting the first packet of a command's response.
    CommandReply,
    /// Awaiting the leading packet of a prepare reply.
    PreparedReply,
    /// Column (and parameter) definitions streaming.
    ResultMetadata {
        remaining: u32,
        then: AfterMetadata,
    },
    /// Row packets streaming until the terminator.
    ResultRows,
    /// Local-infile upload running; the closing OK follows.
    LocalInfile,
}

/// One decoded server message, flagged when it is the last of the
/// in-flight exchange so the scheduler can release the wire.
#[derive(Debug)]
pub(crate) struct Decoded {
    pub message: ServerMessage,
    pub ends_exchange: bool,
}

/// Frames outbound client messages and decodes the inbound stream.
#[derive(Debug)]
pub(crate) struct MessageDuplexCodec {
    slicer: EnvelopeSlicer,
    assembler: PacketAssembler,
    decode_context: DecodeContext,
    write_sequence_id: u8,
}

impl MessageDuplexCodec {
    pub fn new() -> Self {
        Self {
            slicer: EnvelopeSlicer::new(),
            assembler: PacketAssembler::new(),
            decode_context: DecodeContext::Greeting,
            write_sequence_id: 0,
        }
    }

    /// Buffer the transport should read into.
    pub fn read_buf(&mut self) -> &mut BytesMut {
        self.slicer.read_buf()
    }

    /// Appends raw inbound bytes (test and handshake convenience).
    #[cfg(test)]
    pub fn feed(&mut self, chunk: &[u8]) {
        self.slicer.feed(chunk);
    }

    /// Decodes the next complete server message, if buffered bytes
    /// contain one.
    pub fn next_message(&mut self, ctx: &mut ConnectionContext) -> Result<Option<Decoded>> {
        while let Some(envelope) = self.slicer.next_envelope() {
            trace!(
                sequence_id = envelope.sequence_id,
                len = envelope.payload.len(),
                "inbound envelope"
            );
            if let Some(packet) = self.assembler.push(envelope)? {
                return self.decode_packet(ctx, packet).map(Some);
            }
        }
        Ok(None)
    }

    /// Serialises `message` into envelopes with correct sequence ids.
    ///
    /// Command messages reset the sequence to 0 (a new exchange);
    /// handshake-phase and local-infile messages continue the run the
    /// server left off.
    pub fn encode(
        &mut self,
        message: &ClientMessage,
        ctx: &ConnectionContext,
        out: &mut BytesMut,
    ) {
        let mut payload = BytesMut::new();
        message.encode(ctx, &mut payload);

        self.write_sequence_id = if message.continues_sequence() {
            self.assembler.next_sequence_id()
        } else {
            0
        };
        write_envelopes(&payload, &mut self.write_sequence_id, out);
        self.assembler.expect_sequence_id(self.write_sequence_id);

        self.drive_by_request(message);
    }

    /// The outbound command decides how its reply is to be read.
    fn drive_by_request(&mut self, message: &ClientMessage) {
        self.decode_context = match message {
            // ChangeUser re-runs authentication mid-connection, so its
            // reply is read like a handshake response's.
            ClientMessage::HandshakeResponse(_)
            | ClientMessage::AuthContinue(_)
            | ClientMessage::ChangeUser(_) => DecodeContext::AuthReply,
            ClientMessage::Prepare(_) => DecodeContext::PreparedReply,
            ClientMessage::Fetch { .. } => DecodeContext::ResultRows,
            // No reply expected; the mode is untouched.
            ClientMessage::SslRequest
            | ClientMessage::Exit
            | ClientMessage::StmtClose { .. }
            | ClientMessage::LocalInfileData(_) => self.decode_context,
            _ => DecodeContext::CommandReply,
        };
    }

    fn decode_packet(
        &mut self,
        ctx: &mut ConnectionContext,
        packet: Vec<Bytes>,
    ) -> Result<Decoded> {
        let total_len: u64 = packet.iter().map(|b| b.len() as u64).sum();
        let payload = contiguous(&packet);
        let Some(&first) = payload.first() else {
            return Err(Error::ProtocolViolation("empty packet".into()));
        };

        match self.decode_context {
            DecodeContext::Greeting => {
                if first == 0xFF {
                    return self.terminal(ServerMessage::Error(decode_err(&payload)?));
                }
                self.decode_context = DecodeContext::AuthReply;
                Ok(Decoded {
                    message: ServerMessage::HandshakeGreeting(decode_greeting(&payload)?),
                    ends_exchange: false,
                })
            }

            DecodeContext::AuthReply => match first {
                0x00 => {
                    let ok = decode_ok(&payload)?;
                    ctx.server_status = ok.status_flags;
                    self.terminal(ServerMessage::Ok(ok))
                }
                0xFF => self.terminal(ServerMessage::Error(decode_err(&payload)?)),
                0xFE => Ok(Decoded {
                    message: decode_auth_switch(&payload)?,
                    ends_exchange: false,
                }),
                0x01 => Ok(Decoded {
                    message: ServerMessage::AuthMoreData(payload[1..].to_vec()),
                    ends_exchange: false,
                }),
                other => Err(Error::ProtocolViolation(format!(
                    "unexpected auth reply 0x{other:02X}"
                ))),
            },

            DecodeContext::CommandReply => match first {
                0x00 if total_len >= 7 => {
                    let ok = decode_ok(&payload)?;
                    ctx.server_status = ok.status_flags;
                    self.terminal(ServerMessage::Ok(ok))
                }
                0xFF => self.terminal(ServerMessage::Error(decode_err(&payload)?)),
                0xFE if total_len < 9 => {
                    let eof = decode_eof(&payload)?;
                    ctx.server_status = eof.status_flags;
                    self.terminal(ServerMessage::Eof(eof))
                }
                0xFB => {
                    self.decode_context = DecodeContext::LocalInfile;
                    Ok(Decoded {
                        message: decode_local_infile(&payload)?,
                        ends_exchange: false,
                    })
                }
                _ => {
                    let mut reader = crate::messages::PayloadReader::new(&payload);
                    let count = reader.read_lenenc_int().ok_or_else(|| {
                        Error::ProtocolViolation("malformed column count".into())
                    })?;
                    if count == 0 {
                        return Err(Error::ProtocolViolation("zero column count".into()));
                    }
                    self.decode_context = DecodeContext::ResultMetadata {
                        remaining: count as u32,
                        then: AfterMetadata::Rows,
                    };
                    Ok(Decoded {
                        message: ServerMessage::ColumnCount(count),
                        ends_exchange: false,
                    })
                }
            },

            DecodeContext::PreparedReply => match first {
                0x00 => {
                    let ok = decode_prepared_ok(&payload)?;
                    let remaining = u32::from(ok.params) + u32::from(ok.columns);
                    let message = ServerMessage::PreparedOk(ok);
                    if remaining == 0 {
                        self.terminal(message)
                    } else {
                        self.decode_context = DecodeContext::ResultMetadata {
                            remaining,
                            then: AfterMetadata::Done,
                        };
                        Ok(Decoded {
                            message,
                            ends_exchange: false,
                        })
                    }
                }
                0xFF => self.terminal(ServerMessage::Error(decode_err(&payload)?)),
                other => Err(Error::ProtocolViolation(format!(
                    "unexpected prepare reply 0x{other:02X}"
                ))),
            },

            DecodeContext::ResultMetadata { remaining, then } => match first {
                0xFF => self.terminal(ServerMessage::Error(decode_err(&payload)?)),
                // Block separator in the classic protocol; the final
                // one hands over to rows or ends the prepare reply.
                0xFE if total_len < 9 => {
                    let eof = decode_eof(&payload)?;
                    ctx.server_status = eof.status_flags;
                    if remaining == 0 {
                        match then {
                            AfterMetadata::Rows => {
                                self.decode_context = DecodeContext::ResultRows;
                                Ok(Decoded {
                                    message: ServerMessage::Eof(eof),
                                    ends_exchange: false,
                                })
                            }
                            AfterMetadata::Done => {
                                self.terminal(ServerMessage::Eof(eof))
                            }
                        }
                    } else {
                        Ok(Decoded {
                            message: ServerMessage::Eof(eof),
                            ends_exchange: false,
                        })
                    }
                }
                _ => {
                    let definition = decode_column_definition(&payload)?;
                    let remaining = remaining.saturating_sub(1);
                    let message = ServerMessage::ColumnDefinition(definition);

                    if remaining == 0 && ctx.deprecates_eof() {
                        match then {
                            AfterMetadata::Rows => {
                                self.decode_context = DecodeContext::ResultRows;
                                Ok(Decoded {
                                    message,
                                    ends_exchange: false,
                                })
                            }
                            AfterMetadata::Done => self.terminal(message),
                        }
                    } else {
                        self.decode_context = DecodeContext::ResultMetadata { remaining, then };
                        Ok(Decoded {
                            message,
                            ends_exchange: false,
                        })
                    }
                }
            },

            DecodeContext::ResultRows => match first {
                0xFF => self.terminal(ServerMessage::Error(decode_err(&payload)?)),
                // A row's first byte is a value length marker; 0xFE can
                // only mean an 8-byte length, which forces the packet
                // past the single-envelope bound. Short of that bound,
                // 0xFE is the result terminator.
                0xFE if is_row_terminator(ctx, total_len) => {
                    let message = decode_result_terminator(ctx, &payload)?;
                    if let Some(status) = terminator_status(&message) {
                        ctx.server_status = status;
                    }
                    self.terminal(message)
                }
                _ => Ok(Decoded {
                    message: ServerMessage::Row(RowPacket { buffers: packet }),
                    ends_exchange: false,
                }),
            },

            DecodeContext::LocalInfile => match first {
                0x00 => {
                    let ok = decode_ok(&payload)?;
                    ctx.server_status = ok.status_flags;
                    self.terminal(ServerMessage::Ok(ok))
                }
                0xFF => self.terminal(ServerMessage::Error(decode_err(&payload)?)),
                other => Err(Error::ProtocolViolation(format!(
                    "unexpected local-infile reply 0x{other:02X}"
                ))),
            },
        }
    }

    fn terminal(&mut self, message: ServerMessage) -> Result<Decoded> {
        self.decode_context = DecodeContext::CommandReply;
        Ok(Decoded {
            message,
            ends_exchange: true,
        })
    }
}

fn is_row_terminator(ctx: &ConnectionContext, total_len: u64) -> bool {
    if ctx.deprecates_eof() {
        total_len < crate::envelope::MAX_ENVELOPE_SIZE as u64
    } else {
        total_len < 9
    }
}

fn terminator_status(message: &ServerMessage) -> Option<u16> {
    match message {
        ServerMessage::Ok(ok) => Some(ok.status_flags),
        ServerMessage::Eof(eof) => Some(eof.status_flags),
        _ => None,
    }
}
