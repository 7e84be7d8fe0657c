//! Logic for decoding the messages a server sends.
//!
//! The same leading byte means different things in different phases,
//! so these functions only parse payload layouts; classification is
//! the codec's job.

use bytes::Bytes;

use crate::context::ConnectionContext;
use crate::error::{Error, Result, ServerError};
use crate::messages::PayloadReader;

/// The protocol-10 greeting the server opens a connection with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// Capability flags the server advertises.
    pub capabilities: u32,
    pub collation: u8,
    pub status_flags: u16,
    /// The auth challenge (scramble), both parts joined.
    pub auth_data: Vec<u8>,
    pub auth_plugin: String,
}

/// OK packet, also used as the EOF replacement when
/// `CLIENT_DEPRECATE_EOF` was negotiated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
}

/// Classic EOF packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

/// Metadata of one result-set column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub schema: String,
    pub table: String,
    pub name: String,
    pub charset: u16,
    pub column_length: u32,
    pub type_id: u8,
    pub flags: u16,
    pub decimals: u8,
}

/// First packet of a `COM_STMT_PREPARE` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreparedOk {
    pub statement_id: u32,
    pub columns: u16,
    pub params: u16,
    pub warnings: u16,
}

/// One row, kept as the logical packet's buffers so a value larger
/// than memory-comfortable never gets copied. Feed them to a
/// [`FieldReader`](crate::field::FieldReader).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowPacket {
    pub buffers: Vec<Bytes>,
}

impl RowPacket {
    pub fn len(&self) -> u64 {
        self.buffers.iter().map(|b| b.len() as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A message decoded off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    HandshakeGreeting(Greeting),
    Ok(OkPacket),
    Eof(EofPacket),
    Error(ServerError),
    /// 0xFB: the server asks for the named local file's contents.
    LocalInfileRequest { filename: String },
    /// Number of columns in the result set about to stream.
    ColumnCount(u64),
    ColumnDefinition(ColumnDefinition),
    Row(RowPacket),
    PreparedOk(PreparedOk),
    /// The server wants a different authentication plugin.
    AuthSwitch { plugin: String, data: Vec<u8> },
    /// Extra data from the current plugin (0x01-led).
    AuthMoreData(Vec<u8>),
}

impl ServerMessage {
    /// Warning count, for messages that report one.
    pub fn warnings(&self) -> Option<u16> {
        match self {
            ServerMessage::Ok(ok) => Some(ok.warnings),
            ServerMessage::Eof(eof) => Some(eof.warnings),
            ServerMessage::PreparedOk(ok) => Some(ok.warnings),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerMessage::HandshakeGreeting(g) => {
                write!(f, "HandshakeGreeting(v{}, id {})", g.server_version, g.connection_id)
            }
            ServerMessage::Ok(ok) => write!(f, "Ok(affected {})", ok.affected_rows),
            ServerMessage::Eof(_) => f.write_str("Eof"),
            ServerMessage::Error(e) => write!(f, "Error({e})"),
            ServerMessage::LocalInfileRequest { filename } => {
                write!(f, "LocalInfileRequest({filename})")
            }
            ServerMessage::ColumnCount(n) => write!(f, "ColumnCount({n})"),
            ServerMessage::ColumnDefinition(c) => write!(f, "ColumnDefinition({})", c.name),
            ServerMessage::Row(row) => write!(f, "Row({} bytes)", row.len()),
            ServerMessage::PreparedOk(ok) => write!(f, "PreparedOk(id {})", ok.statement_id),
            ServerMessage::AuthSwitch { plugin, .. } => write!(f, "AuthSwitch({plugin})"),
            ServerMessage::AuthMoreData(_) => f.write_str("AuthMoreData"),
        }
    }
}

fn truncated(what: &str) -> Error {
    Error::ProtocolViolation(format!("truncated {what} packet"))
}

/// Parses the greeting. Layout:
/// protocol version, server version (NUL string), connection id,
/// 8 challenge bytes, filler, lower capability half, collation,
/// status, upper capability half, challenge length, 10 reserved bytes,
/// the challenge remainder, plugin name.
pub(crate) fn decode_greeting(payload: &[u8]) -> Result<Greeting> {
    let mut r = PayloadReader::new(payload);

    let protocol_version = r.read_u8().ok_or_else(|| truncated("greeting"))?;
    if protocol_version != 10 {
        return Err(Error::ProtocolViolation(format!(
            "unsupported handshake protocol version {protocol_version}"
        )));
    }

    let server_version = r.read_null_string().ok_or_else(|| truncated("greeting"))?;
    let connection_id = r.read_u32_le().ok_or_else(|| truncated("greeting"))?;

    let mut auth_data = r
        .read_bytes(8)
        .ok_or_else(|| truncated("greeting"))?
        .to_vec();
    r.skip(1);

    let caps_low = r.read_u16_le().ok_or_else(|| truncated("greeting"))?;
    let collation = r.read_u8().unwrap_or(0);
    let status_flags = r.read_u16_le().unwrap_or(0);
    let caps_high = r.read_u16_le().unwrap_or(0);
    let capabilities = u32::from(caps_low) | (u32::from(caps_high) << 16);

    let auth_data_len = if capabilities & crate::context::capabilities::CLIENT_PLUGIN_AUTH != 0 {
        r.read_u8().unwrap_or(0) as usize
    } else {
        r.skip(1);
        0
    };
    r.skip(10);

    if capabilities & crate::context::capabilities::CLIENT_SECURE_CONNECTION != 0 {
        // Part two is auth_data_len - 8 bytes, 13 by convention, with a
        // trailing NUL that is not part of the challenge.
        let part_two = auth_data_len.saturating_sub(8).max(13);
        if let Some(data) = r.read_bytes(part_two) {
            let data = data.strip_suffix(&[0]).unwrap_or(data);
            auth_data.extend_from_slice(data);
        }
    }

    let auth_plugin = if capabilities & crate::context::capabilities::CLIENT_PLUGIN_AUTH != 0 {
        r.read_null_string().unwrap_or_default()
    } else {
        String::new()
    };

    Ok(Greeting {
        protocol_version,
        server_version,
        connection_id,
        capabilities,
        collation,
        status_flags,
        auth_data,
        auth_plugin,
    })
}

/// Parses an OK packet body after its 0x00 (or 0xFE) marker.
pub(crate) fn decode_ok(payload: &[u8]) -> Result<OkPacket> {
    let mut r = PayloadReader::new(payload);
    r.skip(1);

    let affected_rows = r.read_lenenc_int().ok_or_else(|| truncated("OK"))?;
    let last_insert_id = r.read_lenenc_int().ok_or_else(|| truncated("OK"))?;
    let status_flags = r.read_u16_le().ok_or_else(|| truncated("OK"))?;
    let warnings = r.read_u16_le().ok_or_else(|| truncated("OK"))?;
    let info = r.read_rest_string();

    Ok(OkPacket {
        affected_rows,
        last_insert_id,
        status_flags,
        warnings,
        info,
    })
}

pub(crate) fn decode_eof(payload: &[u8]) -> Result<EofPacket> {
    let mut r = PayloadReader::new(payload);
    r.skip(1);

    let warnings = r.read_u16_le().unwrap_or(0);
    let status_flags = r.read_u16_le().unwrap_or(0);
    Ok(EofPacket {
        warnings,
        status_flags,
    })
}

/// Parses an ERR packet. The `#`-marked SQL state only exists in
/// protocol 4.1 command-phase errors; handshake errors omit it.
pub(crate) fn decode_err(payload: &[u8]) -> Result<ServerError> {
    let mut r = PayloadReader::new(payload);
    r.skip(1);

    let code = r.read_u16_le().ok_or_else(|| truncated("ERR"))?;
    let sql_state = if r.peek() == Some(b'#') {
        r.skip(1);
        r.read_string(5).ok_or_else(|| truncated("ERR"))?
    } else {
        String::new()
    };
    let message = r.read_rest_string();

    Ok(ServerError {
        code,
        sql_state,
        message,
    })
}

pub(crate) fn decode_column_definition(payload: &[u8]) -> Result<ColumnDefinition> {
    let mut r = PayloadReader::new(payload);

    // catalog, always "def"
    r.read_lenenc_string()
        .ok_or_else(|| truncated("column definition"))?;
    let schema = r
        .read_lenenc_string()
        .ok_or_else(|| truncated("column definition"))?;
    let table = r
        .read_lenenc_string()
        .ok_or_else(|| truncated("column definition"))?;
    // org_table
    r.read_lenenc_string()
        .ok_or_else(|| truncated("column definition"))?;
    let name = r
        .read_lenenc_string()
        .ok_or_else(|| truncated("column definition"))?;
    // org_name
    r.read_lenenc_string()
        .ok_or_else(|| truncated("column definition"))?;

    // fixed-length block, prefixed with its own length (0x0C)
    r.read_lenenc_int()
        .ok_or_else(|| truncated("column definition"))?;
    let charset = r.read_u16_le().ok_or_else(|| truncated("column definition"))?;
    let column_length = r.read_u32_le().ok_or_else(|| truncated("column definition"))?;
    let type_id = r.read_u8().ok_or_else(|| truncated("column definition"))?;
    let flags = r.read_u16_le().ok_or_else(|| truncated("column definition"))?;
    let decimals = r.read_u8().ok_or_else(|| truncated("column definition"))?;

    Ok(ColumnDefinition {
        schema,
        table,
        name,
        charset,
        column_length,
        type_id,
        flags,
        decimals,
    })
}

pub(crate) fn decode_prepared_ok(payload: &[u8]) -> Result<PreparedOk> {
    let mut r = PayloadReader::new(payload);
    r.skip(1);

    let statement_id = r.read_u32_le().ok_or_else(|| truncated("prepare OK"))?;
    let columns = r.read_u16_le().ok_or_else(|| truncated("prepare OK"))?;
    let params = r.read_u16_le().ok_or_else(|| truncated("prepare OK"))?;
    r.skip(1);
    let warnings = r.read_u16_le().unwrap_or(0);

    Ok(PreparedOk {
        statement_id,
        columns,
        params,
        warnings,
    })
}

pub(crate) fn decode_auth_switch(payload: &[u8]) -> Result<ServerMessage> {
    let mut r = PayloadReader::new(payload);
    r.skip(1);

    let plugin = r.read_null_string().ok_or_else(|| truncated("auth switch"))?;
    let mut data = r.read_rest().to_vec();
    if data.last() == Some(&0) {
        data.pop();
    }

    Ok(ServerMessage::AuthSwitch { plugin, data })
}

pub(crate) fn decode_local_infile(payload: &[u8]) -> Result<ServerMessage> {
    let mut r = PayloadReader::new(payload);
    r.skip(1);
    Ok(ServerMessage::LocalInfileRequest {
        filename: r.read_rest_string(),
    })
}

/// Classifies a 0xFE-led result terminator as a classic EOF or a
/// terminal OK, per the negotiated capabilities.
pub(crate) fn decode_result_terminator(
    ctx: &ConnectionContext,
    payload: &[u8],
) -> Result<ServerMessage> {
    if ctx.deprecates_eof() {
        Ok(ServerMessage::Ok(decode_ok(payload)?))
    } else {
        Ok(ServerMessage::Eof(decode_eof(payload)?))
    }
}

#[cfg(test)]
mod tests {
    use super::{
        decode_column_definition, decode_err, decode_greeting, decode_ok, decode_prepared_ok,
    };
    use crate::messages::put_lenenc_bytes;
    use bytes::{BufMut, BytesMut};

    fn sample_greeting() -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(10);
        buf.put_slice(b"5.7.40\0");
        buf.put_u32_le(42);
        buf.put_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        buf.put_u8(0);
        buf.put_u16_le(0xF7FF); // lower capabilities
        buf.put_u8(45);
        buf.put_u16_le(2);
        buf.put_u16_le(0xFFFF); // upper capabilities
        buf.put_u8(21); // challenge length
        buf.put_bytes(0, 10);
        buf.put_slice(&[9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 0]);
        buf.put_slice(b"mysql_native_password\0");
        buf.to_vec()
    }

    #[test]
    fn test_decode_greeting() {
        let greeting = decode_greeting(&sample_greeting()).unwrap();

        assert_eq!(greeting.protocol_version, 10);
        assert_eq!(greeting.server_version, "5.7.40");
        assert_eq!(greeting.connection_id, 42);
        assert_eq!(greeting.capabilities, 0xFFFF_F7FF);
        assert_eq!(greeting.collation, 45);
        assert_eq!(greeting.status_flags, 2);
        assert_eq!(greeting.auth_data.len(), 20);
        assert_eq!(greeting.auth_data[..8], [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(greeting.auth_plugin, "mysql_native_password");
    }

    #[test]
    fn test_decode_greeting_rejects_old_protocol() {
        let mut payload = sample_greeting();
        payload[0] = 9;
        assert!(decode_greeting(&payload).is_err());
    }

    #[test]
    fn test_decode_ok() {
        let ok = decode_ok(&[0x00, 0x01, 0x2A, 0x02, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(ok.affected_rows, 1);
        assert_eq!(ok.last_insert_id, 42);
        assert_eq!(ok.status_flags, 2);
        assert_eq!(ok.warnings, 0);
        assert!(ok.info.is_empty());
    }

    #[test]
    fn test_decode_err_with_sql_state() {
        let mut payload = vec![0xFF, 0x15, 0x04, b'#'];
        payload.extend_from_slice(b"28000");
        payload.extend_from_slice(b"Access denied");

        let err = decode_err(&payload).unwrap();
        assert_eq!(err.code, 1045);
        assert_eq!(err.sql_state, "28000");
        assert_eq!(err.message, "Access denied");
    }

    #[test]
    fn test_decode_err_without_sql_state() {
        let mut payload = vec![0xFF, 0x15, 0x04];
        payload.extend_from_slice(b"Access denied");

        let err = decode_err(&payload).unwrap();
        assert_eq!(err.code, 1045);
        assert!(err.sql_state.is_empty());
        assert_eq!(err.message, "Access denied");
    }

    #[test]
    fn test_decode_column_definition() {
        let mut buf = BytesMut::new();
        for field in [&b"def"[..], b"r2dbc", b"t", b"t", b"1", b"1"] {
            put_lenenc_bytes(&mut buf, field);
        }
        buf.put_u8(0x0C);
        buf.put_u16_le(45);
        buf.put_u32_le(11);
        buf.put_u8(0x03); // LONG
        buf.put_u16_le(0x0081);
        buf.put_u8(0);
        buf.put_u16_le(0);

        let def = decode_column_definition(&buf).unwrap();
        assert_eq!(def.schema, "r2dbc");
        assert_eq!(def.table, "t");
        assert_eq!(def.name, "1");
        assert_eq!(def.charset, 45);
        assert_eq!(def.column_length, 11);
        assert_eq!(def.type_id, 0x03);
        assert_eq!(def.flags, 0x0081);
    }

    #[test]
    fn test_decode_prepared_ok() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x00);
        buf.put_u32_le(1);
        buf.put_u16_le(2); // columns
        buf.put_u16_le(1); // params
        buf.put_u8(0);
        buf.put_u16_le(0);

        let ok = decode_prepared_ok(&buf).unwrap();
        assert_eq!(ok.statement_id, 1);
        assert_eq!(ok.columns, 2);
        assert_eq!(ok.params, 1);
    }
}
