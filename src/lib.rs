//! An embeddable SSH server framework.
//!
//! The host program supplies authentication callbacks and handlers for
//! channel and global-request types; the server accepts clients that run
//! shells, execute commands, forward TCP ports, and deliver signals. The
//! SSH transport itself (key exchange, ciphers, packetization) is
//! [`russh`]; everything above it lives here.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hawser::{ServerConfig, SshServer, UnixUserLookup};
//!
//! # #[tokio::main]
//! # async fn main() -> color_eyre::Result<()> {
//! let mut config = ServerConfig::default();
//! config.set_version(2, "example");
//! let mut server = SshServer::new(config);
//! server.set_user_lookup(Arc::new(UnixUserLookup::default()));
//! // server.set_password_callback(...) / set_public_key_callback(...)
//! server.install_default_handlers();
//! let server = Arc::new(server);
//! server.listen(("0.0.0.0", 2222)).await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod bind_addr;
pub mod config;
pub mod context;
pub mod copy;
pub mod direct_tcpip;
pub mod error;
pub mod forward;
mod listener;
pub mod pty;
pub mod router;
pub mod server;
pub mod session;
mod ssh;
pub mod user;
pub mod wire;

pub use auth::{
    AuthLogCallback, BannerCallback, ConnMeta, KbdInteractiveStep, KeyboardInteractiveAuth,
    PasswordAuth, Permissions, PublicKeyAuth,
};
pub use config::ServerConfig;
pub use context::ConnectionContext;
pub use direct_tcpip::DirectTcpIpHandler;
pub use error::ServerError;
pub use forward::TcpIpForwardHandler;
pub use router::{ChannelHandler, ChannelOpen, GlobalReply, GlobalRequest, GlobalRequestHandler};
pub use server::{ConnectCallback, HandshakeErrorCallback, SshServer, TransformConn};
pub use session::{
    CommandResolver, CommandSpec, LoginCommandResolver, RequestLogCallback, SessionHandler,
};
pub use user::{UnixUserLookup, User, UserLookup};
