//! Logic for building the messages a client sends.
//!
//! Every message serialises to one logical packet payload; the codec
//! splits it into envelopes and stamps sequence ids. Serialisation is
//! context-sensitive: negotiated capabilities decide which handshake
//! response fields exist at all.
//!
//! See: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_command_phase.html>

use bytes::{BufMut, Bytes, BytesMut};

use crate::context::{ConnectionContext, capabilities};
use crate::envelope::MAX_ENVELOPE_SIZE;
use crate::messages::{put_cstring, put_lenenc_bytes};

/// Command bytes of the text and binary protocols.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandCode(u8);

impl CommandCode {
    pub const QUIT: Self = Self(0x01);
    pub const QUERY: Self = Self(0x03);
    pub const PING: Self = Self(0x0E);
    pub const CHANGE_USER: Self = Self(0x11);
    pub const STMT_PREPARE: Self = Self(0x16);
    pub const STMT_EXECUTE: Self = Self(0x17);
    pub const STMT_CLOSE: Self = Self(0x19);
    pub const STMT_RESET: Self = Self(0x1A);
    pub const STMT_FETCH: Self = Self(0x1C);
    pub const RESET_CONNECTION: Self = Self(0x1F);
}

impl From<CommandCode> for u8 {
    fn from(value: CommandCode) -> Self {
        value.0
    }
}

/// Fields of the protocol-4.1 handshake response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub user: String,
    /// Scramble computed by the authentication plugin.
    pub auth_response: Vec<u8>,
    pub auth_plugin: String,
    pub database: Option<String>,
    /// Connect attributes, sent when `CLIENT_CONNECT_ATTRS` survived
    /// negotiation.
    pub attributes: Vec<(String, String)>,
}

/// Fields of a `COM_CHANGE_USER` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeUser {
    pub user: String,
    pub auth_response: Vec<u8>,
    pub auth_plugin: String,
    pub database: Option<String>,
}

/// A message the client can put on the wire.
///
/// Variants that own payload buffers (an execute's bound parameters, a
/// local-infile chunk) release them on drop when an exchange is
/// cancelled before they were written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Abbreviated handshake response requesting the TLS upgrade.
    SslRequest,
    /// Full handshake response after the greeting (and TLS, if any).
    HandshakeResponse(HandshakeResponse),
    /// Raw payload of an authentication round-trip.
    AuthContinue(Vec<u8>),
    /// Text protocol statement.
    Query(String),
    /// Prepare a statement.
    Prepare(String),
    /// Execute a prepared statement. `params` is the pre-encoded
    /// null-bitmap/types/values block, produced by the caller's binder.
    Execute {
        statement_id: u32,
        /// Cursor flags byte (0 for no cursor).
        flags: u8,
        params: Bytes,
    },
    /// Fetch rows from a server-side cursor.
    Fetch {
        statement_id: u32,
        row_count: u32,
    },
    /// Reset a prepared statement's accumulated long data.
    StmtReset { statement_id: u32 },
    /// Reset session state without re-authenticating.
    ResetConnection,
    /// Re-authenticate as a different user on the same connection.
    ChangeUser(ChangeUser),
    Ping,
    /// Graceful `COM_QUIT`; the server just closes the transport.
    Exit,
    /// Deallocate a prepared statement. The server sends no reply.
    StmtClose { statement_id: u32 },
    /// One chunk of a `LOCAL INFILE` upload; an empty chunk tells the
    /// server the file is complete.
    LocalInfileData(Bytes),
}

impl ClientMessage {
    /// Whether the server answers this message at all.
    pub fn expects_response(&self) -> bool {
        !matches!(
            self,
            ClientMessage::Exit | ClientMessage::StmtClose { .. } | ClientMessage::SslRequest
        )
    }

    /// Whether this message continues the current sequence-id run
    /// instead of starting a new exchange at 0. True for everything
    /// inside the handshake and for local-infile chunks.
    pub(crate) fn continues_sequence(&self) -> bool {
        matches!(
            self,
            ClientMessage::SslRequest
                | ClientMessage::HandshakeResponse(_)
                | ClientMessage::AuthContinue(_)
                | ClientMessage::LocalInfileData(_)
        )
    }

    /// Serialises the payload (without envelope framing) into `out`.
    pub(crate) fn encode(&self, ctx: &ConnectionContext, out: &mut BytesMut) {
        match self {
            ClientMessage::SslRequest => {
                put_handshake_prelude(ctx, ctx.capabilities | capabilities::CLIENT_SSL, out);
            }
            ClientMessage::HandshakeResponse(response) => {
                encode_handshake_response(response, ctx, out);
            }
            ClientMessage::AuthContinue(payload) => out.put_slice(payload),
            ClientMessage::Query(sql) => {
                out.put_u8(CommandCode::QUERY.into());
                out.put_slice(sql.as_bytes());
            }
            ClientMessage::Prepare(sql) => {
                out.put_u8(CommandCode::STMT_PREPARE.into());
                out.put_slice(sql.as_bytes());
            }
            ClientMessage::Execute {
                statement_id,
                flags,
                params,
            } => {
                out.put_u8(CommandCode::STMT_EXECUTE.into());
                out.put_u32_le(*statement_id);
                out.put_u8(*flags);
                // iteration-count, always 1
                out.put_u32_le(1);
                out.put_slice(params);
            }
            ClientMessage::Fetch {
                statement_id,
                row_count,
            } => {
                out.put_u8(CommandCode::STMT_FETCH.into());
                out.put_u32_le(*statement_id);
                out.put_u32_le(*row_count);
            }
            ClientMessage::StmtReset { statement_id } => {
                out.put_u8(CommandCode::STMT_RESET.into());
                out.put_u32_le(*statement_id);
            }
            ClientMessage::ResetConnection => out.put_u8(CommandCode::RESET_CONNECTION.into()),
            ClientMessage::ChangeUser(change) => encode_change_user(change, ctx, out),
            ClientMessage::Ping => out.put_u8(CommandCode::PING.into()),
            ClientMessage::Exit => out.put_u8(CommandCode::QUIT.into()),
            ClientMessage::StmtClose { statement_id } => {
                out.put_u8(CommandCode::STMT_CLOSE.into());
                out.put_u32_le(*statement_id);
            }
            ClientMessage::LocalInfileData(chunk) => out.put_slice(chunk),
        }
    }
}

impl std::fmt::Display for ClientMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ClientMessage::SslRequest => "SslRequest",
            ClientMessage::HandshakeResponse(_) => "HandshakeResponse",
            ClientMessage::AuthContinue(_) => "AuthContinue",
            ClientMessage::Query(_) => "Query",
            ClientMessage::Prepare(_) => "Prepare",
            ClientMessage::Execute { .. } => "Execute",
            ClientMessage::Fetch { .. } => "Fetch",
            ClientMessage::StmtReset { .. } => "StmtReset",
            ClientMessage::ResetConnection => "ResetConnection",
            ClientMessage::ChangeUser(_) => "ChangeUser",
            ClientMessage::Ping => "Ping",
            ClientMessage::Exit => "Exit",
            ClientMessage::StmtClose { .. } => "StmtClose",
            ClientMessage::LocalInfileData(_) => "LocalInfileData",
        };
        f.write_str(name)
    }
}

/// Capability flags, max packet size, collation and the 23 reserved
/// zero bytes shared by the SSL request and the full response.
fn put_handshake_prelude(ctx: &ConnectionContext, caps: u32, out: &mut BytesMut) {
    out.put_u32_le(caps);
    out.put_u32_le(MAX_ENVELOPE_SIZE as u32);
    out.put_u8(ctx.collation);
    out.put_bytes(0, 23);
}

fn encode_handshake_response(
    response: &HandshakeResponse,
    ctx: &ConnectionContext,
    out: &mut BytesMut,
) {
    let caps = ctx.capabilities;
    put_handshake_prelude(ctx, caps, out);

    put_cstring(out, response.user.as_bytes());

    if caps & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        put_lenenc_bytes(out, &response.auth_response);
    } else if caps & capabilities::CLIENT_SECURE_CONNECTION != 0 {
        // Auth responses are scrambles, always < 256 bytes.
        out.put_u8(response.auth_response.len() as u8);
        out.put_slice(&response.auth_response);
    } else {
        put_cstring(out, &response.auth_response);
    }

    if caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
        put_cstring(out, response.database.as_deref().unwrap_or("").as_bytes());
    }

    if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        put_cstring(out, response.auth_plugin.as_bytes());
    }

    if caps & capabilities::CLIENT_CONNECT_ATTRS != 0 && !response.attributes.is_empty() {
        let mut attrs = BytesMut::new();
        for (key, value) in &response.attributes {
            put_lenenc_bytes(&mut attrs, key.as_bytes());
            put_lenenc_bytes(&mut attrs, value.as_bytes());
        }
        put_lenenc_bytes(out, &attrs);
    }
}

fn encode_change_user(change: &ChangeUser, ctx: &ConnectionContext, out: &mut BytesMut) {
    let caps = ctx.capabilities;

    out.put_u8(CommandCode::CHANGE_USER.into());
    put_cstring(out, change.user.as_bytes());

    if caps & capabilities::CLIENT_SECURE_CONNECTION != 0 {
        out.put_u8(change.auth_response.len() as u8);
        out.put_slice(&change.auth_response);
    } else {
        put_cstring(out, &change.auth_response);
    }

    put_cstring(out, change.database.as_deref().unwrap_or("").as_bytes());
    out.put_u16_le(u16::from(ctx.collation));

    if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        put_cstring(out, change.auth_plugin.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Buf, BytesMut};

    use crate::context::{ConnectionContext, capabilities};
    use crate::envelope::MAX_ENVELOPE_SIZE;

    use super::{ClientMessage, HandshakeResponse};

    fn command_context() -> ConnectionContext {
        let mut ctx = ConnectionContext::default();
        ctx.capabilities = capabilities::DEFAULT_CLIENT_FLAGS;
        ctx
    }

    fn encode(msg: &ClientMessage, ctx: &ConnectionContext) -> BytesMut {
        let mut out = BytesMut::new();
        msg.encode(ctx, &mut out);
        out
    }

    #[test]
    fn test_encode_ping() {
        let out = encode(&ClientMessage::Ping, &command_context());
        assert_eq!(&out[..], &[0x0E]);
    }

    #[test]
    fn test_encode_quit() {
        let out = encode(&ClientMessage::Exit, &command_context());
        assert_eq!(&out[..], &[0x01]);
    }

    #[test]
    fn test_encode_query() {
        let out = encode(
            &ClientMessage::Query("SELECT 1".into()),
            &command_context(),
        );
        assert_eq!(out[0], 0x03);
        assert_eq!(&out[1..], b"SELECT 1");
    }

    #[test]
    fn test_encode_execute() {
        let msg = ClientMessage::Execute {
            statement_id: 7,
            flags: 0,
            params: bytes::Bytes::from_static(&[0xAA, 0xBB]),
        };
        let mut out = encode(&msg, &command_context());

        assert_eq!(out.get_u8(), 0x17);
        assert_eq!(out.get_u32_le(), 7);
        assert_eq!(out.get_u8(), 0);
        assert_eq!(out.get_u32_le(), 1);
        assert_eq!(&out[..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_encode_stmt_close() {
        let msg = ClientMessage::StmtClose { statement_id: 3 };
        let mut out = encode(&msg, &command_context());
        assert_eq!(out.get_u8(), 0x19);
        assert_eq!(out.get_u32_le(), 3);
        assert!(!msg.expects_response());
    }

    #[test]
    fn test_encode_fetch() {
        let msg = ClientMessage::Fetch {
            statement_id: 9,
            row_count: 100,
        };
        let mut out = encode(&msg, &command_context());
        assert_eq!(out.get_u8(), 0x1C);
        assert_eq!(out.get_u32_le(), 9);
        assert_eq!(out.get_u32_le(), 100);
    }

    #[test]
    fn test_encode_stmt_reset_and_reset_connection() {
        let mut out = encode(
            &ClientMessage::StmtReset { statement_id: 4 },
            &command_context(),
        );
        assert_eq!(out.get_u8(), 0x1A);
        assert_eq!(out.get_u32_le(), 4);

        let out = encode(&ClientMessage::ResetConnection, &command_context());
        assert_eq!(&out[..], &[0x1F]);
    }

    #[test]
    fn test_encode_change_user() {
        let mut ctx = command_context();
        ctx.collation = 45;
        let msg = ClientMessage::ChangeUser(super::ChangeUser {
            user: "other".into(),
            auth_response: vec![0xAB; 20],
            auth_plugin: "mysql_native_password".into(),
            database: Some("r2dbc".into()),
        });
        let mut out = encode(&msg, &ctx);

        assert_eq!(out.get_u8(), 0x11);
        assert_eq!(out.split_to(6).to_vec(), b"other\0");
        assert_eq!(out.get_u8(), 20);
        out.advance(20);
        assert_eq!(out.split_to(6).to_vec(), b"r2dbc\0");
        assert_eq!(out.get_u16_le(), 45);
        assert_eq!(out.to_vec(), b"mysql_native_password\0");
    }

    #[test]
    fn test_encode_ssl_request() {
        let mut ctx = command_context();
        ctx.collation = 45;
        let mut out = encode(&ClientMessage::SslRequest, &ctx);

        assert_eq!(out.len(), 32);
        assert_eq!(
            out.get_u32_le(),
            ctx.capabilities | capabilities::CLIENT_SSL
        );
        assert_eq!(out.get_u32_le(), MAX_ENVELOPE_SIZE as u32);
        assert_eq!(out.get_u8(), 45);
        assert!(out.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_encode_handshake_response() {
        let mut ctx = command_context();
        ctx.collation = 45;
        let msg = ClientMessage::HandshakeResponse(HandshakeResponse {
            user: "root".into(),
            auth_response: vec![0xAB; 20],
            auth_plugin: "mysql_native_password".into(),
            database: Some("r2dbc".into()),
            attributes: Vec::new(),
        });
        let mut out = encode(&msg, &ctx);

        assert_eq!(out.get_u32_le(), ctx.capabilities);
        assert_eq!(out.get_u32_le(), MAX_ENVELOPE_SIZE as u32);
        assert_eq!(out.get_u8(), 45);
        out.advance(23);

        let user = out.split_to(5).to_vec();
        assert_eq!(&user, b"root\0");

        // lenenc auth response
        assert_eq!(out.get_u8(), 20);
        out.advance(20);

        let db: Vec<u8> = out.split_to(6).to_vec();
        assert_eq!(&db, b"r2dbc\0");

        let plugin = out.split_to("mysql_native_password".len() + 1).to_vec();
        assert_eq!(&plugin, b"mysql_native_password\0");
        assert!(out.is_empty());
    }

    #[test]
    fn test_handshake_messages_continue_sequence() {
        assert!(ClientMessage::SslRequest.continues_sequence());
        assert!(ClientMessage::AuthContinue(vec![]).continues_sequence());
        assert!(!ClientMessage::Ping.continues_sequence());
        assert!(!ClientMessage::Query(String::new()).continues_sequence());
    }
}
