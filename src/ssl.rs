//! The in-band TLS upgrade performed mid-handshake.
//!
//! MySQL upgrades inside the protocol: after the cleartext greeting
//! the client sends an abbreviated handshake response with the SSL
//! capability bit, then both sides switch the transport to TLS and the
//! handshake continues encrypted. The TLS engine itself is supplied by
//! the caller as an async upgrade function, so this crate does not pin
//! a TLS implementation.

use crate::context::capabilities;
use crate::error::{Error, Result};

/// Whether and how hard to ask for TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Never upgrade.
    #[default]
    Disabled,
    /// Upgrade when the server supports it, continue cleartext when it
    /// does not.
    Preferred,
    /// Fail the connection unless the upgrade happens.
    Required,
}

impl SslMode {
    /// Whether this mode wants the bridge at all.
    pub fn start_ssl(&self) -> bool {
        !matches!(self, SslMode::Disabled)
    }
}

/// What the handshake should do about TLS, decided from the greeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SslDecision {
    /// Proceed cleartext; nothing to report.
    Skip,
    /// Proceed cleartext because the server cannot do better.
    Unsupported,
    /// Send the SSL request and run the upgrade.
    Bridge,
}

/// Applies the mode against the server's advertised capabilities.
///
/// `has_engine` is false when the caller connected without an upgrade
/// function; a required upgrade is then unsatisfiable.
pub(crate) fn negotiate(
    mode: SslMode,
    server_capabilities: u32,
    has_engine: bool,
) -> Result<SslDecision> {
    if !mode.start_ssl() {
        return Ok(SslDecision::Skip);
    }

    let server_supports = server_capabilities & capabilities::CLIENT_SSL != 0;
    match (mode, server_supports, has_engine) {
        (SslMode::Disabled, ..) => Ok(SslDecision::Skip),
        (SslMode::Required, false, _) => Err(Error::TlsNegotiation(
            "TLS required but the server does not support it".into(),
        )),
        (SslMode::Required, true, false) => Err(Error::TlsNegotiation(
            "TLS required but no TLS engine was provided".into(),
        )),
        (SslMode::Preferred, false, _) => Ok(SslDecision::Unsupported),
        (SslMode::Preferred, true, false) => Ok(SslDecision::Skip),
        (_, true, true) => Ok(SslDecision::Bridge),
    }
}
