//! Muxer adaptor: the factory the host hands secured connections to.

use crate::config::Config;
use crate::error::Result;
use crate::session::{Role, Session};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Protocol identifier used during muxer negotiation
pub const PROTOCOL_ID: &str = "/yamux/1.0.0";

/// A stream muxer the host layer can negotiate and apply to a connection
pub trait MuxerAdaptor {
    /// Identifier offered during protocol negotiation
    fn protocol_id(&self) -> &'static str;

    /// Take ownership of `conn` and start multiplexing over it
    fn mux_connection<T>(&self, conn: T, role: Role) -> Result<Session>
    where
        T: AsyncRead + AsyncWrite + Send + 'static;
}

/// Yamux muxer; every session it creates shares one [`Config`]
#[derive(Debug, Clone, Default)]
pub struct Yamux {
    config: Config,
}

impl Yamux {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl MuxerAdaptor for Yamux {
    fn protocol_id(&self) -> &'static str {
        PROTOCOL_ID
    }

    fn mux_connection<T>(&self, conn: T, role: Role) -> Result<Session>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        debug!("Muxing connection with {} as {:?}", PROTOCOL_ID, role);
        Session::new(conn, role, self.config.clone())
    }
}
