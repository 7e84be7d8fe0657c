//! Connection establishment: greeting, capability negotiation, the
//! optional TLS bridge and the authentication round-trips.
//!
//! The handshake runs before any user exchange is admitted; only after
//! the terminal OK does the engine task spawn and the connection enter
//! command phase.

use std::future::Future;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::client::Client;
use crate::codec::MessageDuplexCodec;
use crate::context::{ConnectionContext, Lifecycle, ServerVersion, SslState, capabilities, collations};
use crate::error::{Error, Result};
use crate::messages::client::HandshakeResponse;
use crate::messages::{ClientMessage, ServerMessage};
use crate::ssl::{SslDecision, SslMode};

mod auth;

pub use auth::{AuthPlugin, plugins, resolve_plugin};

/// Builder for configuring and establishing MySQL connections.
pub struct ConnectionBuilder {
    user: String,
    password: Option<String>,
    database: Option<String>,
    collation: u8,
    ssl_mode: SslMode,
    attributes: Vec<(String, String)>,
}

impl ConnectionBuilder {
    /// Creates a new connection builder for the given user.
    ///
    /// Defaults to no password, no schema, utf8mb4 and TLS disabled.
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: None,
            database: None,
            collation: collations::DEFAULT_COLLATION,
            ssl_mode: SslMode::default(),
            attributes: vec![("_client_name".into(), "mysql_stream".into())],
        }
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets the default schema to connect to.
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Sets the collation id sent as the connection character set.
    pub fn collation(mut self, collation: u8) -> Self {
        self.collation = collation;
        self
    }

    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = mode;
        self
    }

    /// Adds a connect attribute reported to the server.
    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    /// Establishes a cleartext connection over the provided stream.
    ///
    /// Fails with [`Error::TlsNegotiation`] when the mode is
    /// [`SslMode::Required`]: without an upgrade function there is no
    /// TLS engine to bridge with.
    pub async fn connect<S>(&self, mut stream: S) -> Result<Client>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        // With no engine to hand the stream to, negotiate() never
        // returns Bridge here.
        let (mut handshake, _) = self.begin(&mut stream, false).await?;
        self.authenticate(&mut stream, &mut handshake).await?;
        Ok(handshake.spawn(stream))
    }

    /// Establishes a connection, upgrading to TLS after the greeting
    /// when the negotiated mode calls for it.
    ///
    /// `upgrade_fn` receives the cleartext stream right after the SSL
    /// request envelope went out and returns the encrypted stream the
    /// rest of the handshake continues on.
    pub async fn connect_with_tls<S, T, F, Fut>(&self, mut stream: S, upgrade_fn: F) -> Result<Client>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        F: FnOnce(S) -> Fut,
        Fut: Future<Output = std::io::Result<T>>,
    {
        let (mut handshake, decision) = self.begin(&mut stream, true).await?;

        // Preferred mode against a server without TLS, or TLS disabled
        // outright: the handshake continues on the cleartext stream.
        if decision != SslDecision::Bridge {
            self.authenticate(&mut stream, &mut handshake).await?;
            return Ok(handshake.spawn(stream));
        }

        handshake.context.lifecycle = Lifecycle::Ssl;
        handshake.context.capabilities |= capabilities::CLIENT_SSL;

        let mut out = BytesMut::new();
        handshake
            .codec
            .encode(&ClientMessage::SslRequest, &handshake.context, &mut out);
        stream.write_all(&out).await?;
        stream.flush().await?;

        let mut stream = upgrade_fn(stream)
            .await
            .map_err(|e| Error::TlsNegotiation(e.to_string()))?;
        handshake.context.ssl_state = SslState::BridgeSuccess;
        debug!("TLS bridge established");

        self.authenticate(&mut stream, &mut handshake).await?;
        Ok(handshake.spawn(stream))
    }

    /// Reads the greeting and negotiates capabilities and TLS.
    async fn begin<S>(&self, stream: &mut S, has_engine: bool) -> Result<(Handshake, SslDecision)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut codec = MessageDuplexCodec::new();
        let mut context = ConnectionContext::new(self.collation);

        let greeting = match next_message(stream, &mut codec, &mut context).await? {
            ServerMessage::HandshakeGreeting(greeting) => greeting,
            ServerMessage::Error(e) => return Err(Error::Server(e)),
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "expected greeting, got {other}"
                )));
            }
        };

        context.lifecycle = Lifecycle::Handshake;
        context.server_version = ServerVersion::parse(&greeting.server_version);
        context.connection_id = greeting.connection_id;
        context.capabilities = self.requested_capabilities() & greeting.capabilities;
        debug!(
            connection_id = greeting.connection_id,
            server_version = %context.server_version,
            capabilities = format_args!("{:#010X}", context.capabilities),
            "greeting received"
        );

        let decision = crate::ssl::negotiate(self.ssl_mode, greeting.capabilities, has_engine)?;
        if decision == SslDecision::Unsupported {
            context.ssl_state = SslState::Unsupported;
            debug!("server does not support TLS, continuing cleartext");
        }

        // An unrecognised default plugin is not fatal: the server will
        // issue an auth switch if the native proof does not fit.
        let plugin = resolve_plugin(&greeting.auth_plugin)
            .unwrap_or_else(|| resolve_plugin(plugins::MYSQL_NATIVE_PASSWORD).expect("built-in"));

        Ok((
            Handshake {
                codec,
                context,
                plugin,
                challenge: greeting.auth_data,
            },
            decision,
        ))
    }

    /// Sends the handshake response and drives the auth round-trips
    /// until login succeeds.
    async fn authenticate<S>(&self, stream: &mut S, handshake: &mut Handshake) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Handshake {
            codec,
            context,
            plugin,
            challenge,
        } = handshake;

        context.lifecycle = Lifecycle::Auth;
        let secure = context.ssl_state == SslState::BridgeSuccess;
        let proof = plugin.scramble(challenge, self.password.as_deref(), secure)?;

        let response = ClientMessage::HandshakeResponse(HandshakeResponse {
            user: self.user.clone(),
            auth_response: proof,
            auth_plugin: plugin.name().to_string(),
            database: self.database.clone(),
            attributes: self.attributes.clone(),
        });
        write_message(stream, codec, context, &response).await?;

        loop {
            match next_message(stream, codec, context).await? {
                ServerMessage::Ok(_) => {
                    context.lifecycle = Lifecycle::Command;
                    debug!(
                        connection_id = context.connection_id,
                        "login succeeded, entering command phase"
                    );
                    return Ok(());
                }
                ServerMessage::Error(e) => return Err(Error::auth_rejected(e)),
                ServerMessage::AuthSwitch { plugin: name, data } => {
                    *plugin = resolve_plugin(&name).ok_or_else(|| {
                        Error::auth_impossible(format!("unsupported auth plugin {name}"))
                    })?;
                    *challenge = data;
                    let proof = plugin.scramble(challenge, self.password.as_deref(), secure)?;
                    write_message(stream, codec, context, &ClientMessage::AuthContinue(proof))
                        .await?;
                }
                ServerMessage::AuthMoreData(data) => {
                    if let Some(payload) =
                        plugin.next_payload(&data, self.password.as_deref(), secure)?
                    {
                        write_message(
                            stream,
                            codec,
                            context,
                            &ClientMessage::AuthContinue(payload),
                        )
                        .await?;
                    }
                }
                other => {
                    return Err(Error::ProtocolViolation(format!(
                        "unexpected message during authentication: {other}"
                    )));
                }
            }
        }
    }

    fn requested_capabilities(&self) -> u32 {
        let mut caps = capabilities::DEFAULT_CLIENT_FLAGS;
        if self.database.is_none() {
            caps &= !capabilities::CLIENT_CONNECT_WITH_DB;
        }
        if self.attributes.is_empty() {
            caps &= !capabilities::CLIENT_CONNECT_ATTRS;
        }
        caps
    }
}

/// Handshake state carried across the TLS bridge.
struct Handshake {
    codec: MessageDuplexCodec,
    context: ConnectionContext,
    plugin: Box<dyn AuthPlugin>,
    challenge: Vec<u8>,
}

impl Handshake {
    fn spawn<S>(self, stream: S) -> Client
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Client::spawn(stream, self.codec, self.context)
    }
}

async fn next_message<S>(
    stream: &mut S,
    codec: &mut MessageDuplexCodec,
    context: &mut ConnectionContext,
) -> Result<ServerMessage>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(decoded) = codec.next_message(context)? {
            return Ok(decoded.message);
        }
        let n = stream.read_buf(codec.read_buf()).await?;
        if n == 0 {
            return Err(Error::UnexpectedClosed);
        }
    }
}

async fn write_message<S>(
    stream: &mut S,
    codec: &mut MessageDuplexCodec,
    context: &ConnectionContext,
    message: &ClientMessage,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut out = BytesMut::new();
    codec.encode(message, context, &mut out);
    stream.write_all(&out).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::context::capabilities;
    use crate::ssl::SslMode;

    use super::ConnectionBuilder;

    #[test]
    fn test_capabilities_pruned_by_config() {
        let builder = ConnectionBuilder::new("root");
        let caps = builder.requested_capabilities();
        assert_eq!(caps & capabilities::CLIENT_CONNECT_WITH_DB, 0);
        assert_ne!(caps & capabilities::CLIENT_CONNECT_ATTRS, 0);

        let builder = ConnectionBuilder::new("root").database("r2dbc");
        let caps = builder.requested_capabilities();
        assert_ne!(caps & capabilities::CLIENT_CONNECT_WITH_DB, 0);
    }

    #[test]
    fn test_builder_defaults() {
        let builder = ConnectionBuilder::new("root");
        assert_eq!(builder.ssl_mode, SslMode::Disabled);
        assert!(builder.password.is_none());
        assert_eq!(builder.collation, crate::context::collations::DEFAULT_COLLATION);
    }
}
