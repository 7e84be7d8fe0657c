//! MysqlStream.
//!
//! This crate provides a non-blocking engine for the MySQL client/server
//! protocol: it frames and reassembles wire envelopes, serialises
//! concurrent request/response exchanges onto one sequential
//! connection, performs the in-band TLS upgrade, and streams column
//! values out of result packets of any size. Higher-level concerns
//! (SQL APIs, type mapping, pooling) are left to the caller.
//!
//! # Overview
//!
//! The crate is organized around a few core concepts:
//!
//! - **Connection establishment** via [`ConnectionBuilder`], covering
//!   capability negotiation, authentication plugins and TLS
//! - **Exchanges** on a [`Client`]: one request, a stream of server
//!   messages translated by your handler
//! - **Field reading** out of row packets with [`FieldReader`],
//!   including rows larger than 2 GiB
//!
//! # Example: Ping
//!
//! ```no_run
//! use futures::StreamExt;
//! use mysql_stream::{ClientMessage, ConnectionBuilder, ServerMessage};
//!
//! # #[tokio::main]
//! # async fn main() -> mysql_stream::Result<()> {
//! let stream = tokio::net::TcpStream::connect("localhost:3306").await?;
//!
//! let client = ConnectionBuilder::new("root")
//!     .password("secret")
//!     .database("mydb")
//!     .connect(stream)
//!     .await?;
//!
//! let mut responses = client.exchange(ClientMessage::Ping, |message, sink| {
//!     if let ServerMessage::Ok(_) = message {
//!         sink.next(());
//!         sink.complete();
//!     }
//! });
//! responses.next().await.expect("one OK")?;
//!
//! client.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Example: Text query
//!
//! ```no_run
//! # use futures::StreamExt;
//! # use mysql_stream::{Client, ClientMessage, FieldReader, ServerMessage};
//! # async fn example(client: Client) -> mysql_stream::Result<()> {
//! let mut rows = client.exchange(
//!     ClientMessage::Query("SELECT id, name FROM users".into()),
//!     |message, sink| match message {
//!         ServerMessage::Row(row) => sink.next(row),
//!         ServerMessage::Ok(_) | ServerMessage::Eof(_) => sink.complete(),
//!         ServerMessage::Error(e) => sink.error(mysql_stream::Error::Server(e)),
//!         _ => {} // column metadata
//!     },
//! );
//!
//! while let Some(row) = rows.next().await {
//!     let mut reader = FieldReader::new(row?.buffers);
//!     let id = reader.read_var_int_sized_field()?;
//!     let name = reader.read_var_int_sized_field()?;
//!     // hand the values to your decoder
//!     # let _ = (id, name);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Example: TLS
//!
//! TLS is negotiated in-band after the server greeting. The engine is
//! supplied by you as an async upgrade function, so any TLS stack that
//! wraps an `AsyncRead + AsyncWrite` stream works:
//!
//! ```no_run
//! # use mysql_stream::{ConnectionBuilder, SslMode};
//! # use tokio::io::{AsyncRead, AsyncWrite};
//! # async fn example<T, F, Fut>(stream: tokio::net::TcpStream, upgrade_fn: F) -> mysql_stream::Result<()>
//! # where
//! #     T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
//! #     F: FnOnce(tokio::net::TcpStream) -> Fut,
//! #     Fut: std::future::Future<Output = std::io::Result<T>>,
//! # {
//! let client = ConnectionBuilder::new("root")
//!     .ssl_mode(SslMode::Required)
//!     .connect_with_tls(stream, upgrade_fn)
//!     .await?;
//! # let _ = client;
//! # Ok(())
//! # }
//! ```
//!
//! # Concurrency
//!
//! A [`Client`] is cheap to clone and callers may start exchanges from
//! any task. At most one exchange occupies the wire at a time; the
//! rest wait their turn in strict submission order. Dropping an
//! exchange's stream cancels it — undelivered messages are discarded
//! and the engine quietly drains the response to its terminator so the
//! connection stays usable.
//!
//! # Resource handling
//!
//! Row payloads are reference-counted [`bytes::Bytes`] slices of the
//! receive buffers. A [`FieldValue`] holds its spans alive; dropping
//! the last clone releases the memory. Nothing is copied on the read
//! path except fields that straddle an envelope boundary.
//!
//! # Errors
//!
//! Server `ERR` packets fail only the exchange that caused them; the
//! connection stays healthy. Protocol violations and transport errors
//! drain every pending exchange with the same error and close the
//! connection. See [`Error`] for the taxonomy.

mod client;
mod codec;
mod context;
mod envelope;
mod error;
mod field;
mod handshake;
pub mod messages;
mod queue;
mod ssl;

pub use client::{Client, Exchange, ExchangeSink, Exchangeable, RequestHandler};
pub use context::{
    ConnectionContext, Lifecycle, ServerVersion, SslState, capabilities, collations,
    server_status,
};
pub use envelope::{ENVELOPE_HEADER_SIZE, Envelope, EnvelopeSlicer, MAX_ENVELOPE_SIZE, PacketAssembler, write_envelopes};
pub use error::{Error, Result, ServerError};
pub use field::{FieldReader, FieldValue};
pub use handshake::{AuthPlugin, ConnectionBuilder, plugins, resolve_plugin};
pub use messages::client::{ChangeUser, ClientMessage, CommandCode, HandshakeResponse};
pub use messages::server::{
    ColumnDefinition, EofPacket, Greeting, OkPacket, PreparedOk, RowPacket, ServerMessage,
};
pub use ssl::SslMode;
