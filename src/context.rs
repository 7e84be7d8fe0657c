//! Per-connection negotiated state and the lifecycle machine.

/// MySQL capability flags (client and server).
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_NO_SCHEMA: u32 = 1 << 4;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_ODBC: u32 = 1 << 6;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_IGNORE_SPACE: u32 = 1 << 8;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u32 = 1 << 10;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_IGNORE_SIGPIPE: u32 = 1 << 12;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_RESERVED: u32 = 1 << 14;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS: u32 = 1 << 22;
    pub const CLIENT_SESSION_TRACK: u32 = 1 << 23;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;
    pub const CLIENT_OPTIONAL_RESULTSET_METADATA: u32 = 1 << 25;
    pub const CLIENT_ZSTD_COMPRESSION_ALGORITHM: u32 = 1 << 26;
    pub const CLIENT_QUERY_ATTRIBUTES: u32 = 1 << 27;

    /// Capabilities this engine asks for before intersecting with what
    /// the server advertises.
    pub const DEFAULT_CLIENT_FLAGS: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_STATEMENTS
        | CLIENT_MULTI_RESULTS
        | CLIENT_PS_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH
        | CLIENT_CONNECT_ATTRS
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_LOCAL_FILES
        | CLIENT_DEPRECATE_EOF;
}

/// MySQL server status flags, reported in OK and EOF packets.
#[allow(dead_code)]
pub mod server_status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const SERVER_STATUS_CURSOR_EXISTS: u16 = 0x0040;
    pub const SERVER_STATUS_LAST_ROW_SENT: u16 = 0x0080;
    pub const SERVER_SESSION_STATE_CHANGED: u16 = 0x4000;
}

/// Collation ids usable as the connection default character set.
#[allow(dead_code)]
pub mod collations {
    pub const LATIN1_SWEDISH_CI: u8 = 8;
    pub const UTF8_GENERAL_CI: u8 = 33;
    pub const BINARY: u8 = 63;
    pub const UTF8MB4_GENERAL_CI: u8 = 45;
    pub const UTF8MB4_UNICODE_CI: u8 = 224;
    pub const UTF8MB4_0900_AI_CI: u8 = 255;

    pub const DEFAULT_COLLATION: u8 = UTF8MB4_GENERAL_CI;
}

/// Parsed server version, e.g. "5.7.40" or "8.0.34-log".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServerVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl ServerVersion {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parses the leading `major.minor.patch` out of a version string,
    /// ignoring any suffix the server appends.
    pub fn parse(version: &str) -> Self {
        let mut parts = version.split('.');
        let mut next = || {
            parts
                .next()
                .map(|p| {
                    p.chars()
                        .take_while(char::is_ascii_digit)
                        .collect::<String>()
                })
                .and_then(|digits| digits.parse().ok())
                .unwrap_or(0)
        };

        let major = next();
        let minor = next();
        let patch = next();
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl std::fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Connection lifecycle phase.
///
/// Any phase may transition directly to `Disconnecting` on error;
/// `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Transport established, greeting not yet received.
    Connecting,
    /// Greeting received, negotiating capabilities.
    Handshake,
    /// TLS upgrade in progress.
    Ssl,
    /// Handshake response sent, authentication round-trips running.
    Auth,
    /// Login succeeded; user exchanges admitted.
    Command,
    /// Close requested or failure observed; draining.
    Disconnecting,
    /// Transport gone.
    Closed,
}

/// Outcome of the TLS bridge, observable on the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslState {
    /// TLS was not requested.
    Unstarted,
    /// Server lacks TLS support and the mode allowed falling back.
    Unsupported,
    /// The upgrade completed; writes are encrypted.
    BridgeSuccess,
}

/// Mutable per-connection state, owned by the engine task.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    /// Intersection of requested and advertised capability flags.
    pub capabilities: u32,
    pub server_version: ServerVersion,
    pub connection_id: u32,
    /// Collation id sent in the handshake response.
    pub collation: u8,
    /// Status flags from the most recent OK/EOF packet.
    pub server_status: u16,
    pub lifecycle: Lifecycle,
    pub ssl_state: SslState,
}

impl ConnectionContext {
    pub fn new(collation: u8) -> Self {
        Self {
            capabilities: 0,
            server_version: ServerVersion::default(),
            connection_id: 0,
            collation,
            server_status: 0,
            lifecycle: Lifecycle::Connecting,
            ssl_state: SslState::Unstarted,
        }
    }

    /// Whether a capability made it through negotiation.
    pub fn has_capability(&self, flag: u32) -> bool {
        self.capabilities & flag != 0
    }

    /// Whether result sets terminate with the OK-with-EOF-marker form.
    pub fn deprecates_eof(&self) -> bool {
        self.has_capability(capabilities::CLIENT_DEPRECATE_EOF)
    }
}

impl Default for ConnectionContext {
    fn default() -> Self {
        Self::new(collations::DEFAULT_COLLATION)
    }
}

#[cfg(test)]
mod tests {
    use super::{ConnectionContext, ServerVersion, capabilities};

    #[test]
    fn test_parse_plain_version() {
        let version = ServerVersion::parse("5.7.40");
        assert_eq!(version, ServerVersion::new(5, 7, 40));
        assert_eq!(version.to_string(), "5.7.40");
    }

    #[test]
    fn test_parse_suffixed_version() {
        assert_eq!(
            ServerVersion::parse("8.0.34-0ubuntu0.22.04.1"),
            ServerVersion::new(8, 0, 34)
        );
        assert_eq!(ServerVersion::parse("10.11.2-MariaDB"), ServerVersion::new(10, 11, 2));
    }

    #[test]
    fn test_parse_garbage_version() {
        assert_eq!(ServerVersion::parse(""), ServerVersion::new(0, 0, 0));
        assert_eq!(ServerVersion::parse("weird"), ServerVersion::new(0, 0, 0));
    }

    #[test]
    fn test_version_ordering() {
        assert!(ServerVersion::new(8, 0, 0) > ServerVersion::new(5, 7, 44));
    }

    #[test]
    fn test_capability_queries() {
        let mut ctx = ConnectionContext::default();
        ctx.capabilities = capabilities::CLIENT_PROTOCOL_41 | capabilities::CLIENT_DEPRECATE_EOF;

        assert!(ctx.has_capability(capabilities::CLIENT_PROTOCOL_41));
        assert!(!ctx.has_capability(capabilities::CLIENT_SSL));
        assert!(ctx.deprecates_eof());
    }
}
