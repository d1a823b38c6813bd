//! The embeddable server: configuration, handler registries, the accept
//! loop, the active-connection registry, and shutdown.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use russh::server::Handle;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    auth::{
        AuthCallbacks, AuthLogCallback, BannerCallback, KeyboardInteractiveAuth, PasswordAuth,
        PublicKeyAuth,
    },
    config::ServerConfig,
    context::ConnectionContext,
    direct_tcpip::DirectTcpIpHandler,
    error::ServerError,
    forward::TcpIpForwardHandler,
    listener::bind_tcp_listener,
    router::{ChannelHandler, ChannelRouter, GlobalRequestHandler, GlobalRequestRouter},
    session::SessionHandler,
    ssh::ServerHandler,
    user::UserLookup,
    wire,
};

/// Wraps the raw socket before the handshake, e.g. to apply socket
/// options or protocol sniffing. Returning an error skips the
/// connection.
#[async_trait]
pub trait TransformConn: Send + Sync {
    async fn transform(&self, stream: TcpStream, peer: SocketAddr)
        -> color_eyre::Result<TcpStream>;
}

/// Invoked when a connection fails before an SSH connection exists.
pub trait HandshakeErrorCallback: Send + Sync {
    fn on_error(&self, error: &russh::Error, peer: SocketAddr);
}

/// Invoked once the context is fully populated. Returning an error
/// closes the connection.
#[async_trait]
pub trait ConnectCallback: Send + Sync {
    async fn on_connect(&self, ctx: &ConnectionContext) -> color_eyre::Result<()>;
}

pub(crate) struct ConnectionEntry {
    pub(crate) token: CancellationToken,
    pub(crate) handle: Handle,
}

/// The SSH server. Configure callbacks and handlers, wrap it in an
/// [`Arc`], and call [`listen`](Self::listen) or
/// [`serve`](Self::serve).
pub struct SshServer {
    config: ServerConfig,
    pub(crate) channel_router: ChannelRouter,
    pub(crate) global_router: GlobalRequestRouter,
    pub(crate) auth: AuthCallbacks,
    pub(crate) user_lookup: Option<Arc<dyn UserLookup>>,
    transform_conn: Option<Arc<dyn TransformConn>>,
    handshake_error: Option<Arc<dyn HandshakeErrorCallback>>,
    pub(crate) on_connect: Option<Arc<dyn ConnectCallback>>,
    session_counter: AtomicUsize,
    connections: Mutex<HashMap<usize, ConnectionEntry>>,
    // Parent of every connection context; cancelled by shutdown().
    root_token: CancellationToken,
    // Stops the accept loop and disconnects; cancelled by close() too.
    close_token: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl SshServer {
    pub fn new(config: ServerConfig) -> Self {
        SshServer {
            config,
            channel_router: ChannelRouter::default(),
            global_router: GlobalRequestRouter::default(),
            auth: AuthCallbacks::default(),
            user_lookup: None,
            transform_conn: None,
            handshake_error: None,
            on_connect: None,
            session_counter: AtomicUsize::new(0),
            connections: Mutex::new(HashMap::new()),
            root_token: CancellationToken::new(),
            close_token: CancellationToken::new(),
            local_addr: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Register the stock handlers: sessions, direct-tcpip, and remote
    /// forwarding, wired with this server's buffer and queue settings.
    pub fn install_default_handlers(&mut self) {
        let session = Arc::new(SessionHandler::new(
            self.config.queue_capacity,
            self.config.buffer_size,
        ));
        self.register_channel_handler(wire::CHANNEL_TYPE_SESSION, session);
        let direct = Arc::new(DirectTcpIpHandler::new(
            self.config.dial_timeout,
            self.config.buffer_size,
        ));
        self.register_channel_handler(wire::CHANNEL_TYPE_DIRECT_TCPIP, direct);
        let forward = Arc::new(TcpIpForwardHandler::new(self.config.buffer_size));
        self.register_global_handler(wire::GLOBAL_REQUEST_TCPIP_FORWARD, Arc::clone(&forward) as _);
        self.register_global_handler(wire::GLOBAL_REQUEST_CANCEL_TCPIP_FORWARD, forward);
    }

    pub fn register_channel_handler(
        &mut self,
        channel_type: impl Into<String>,
        handler: Arc<dyn ChannelHandler>,
    ) {
        self.channel_router.register(channel_type, handler);
    }

    pub fn register_global_handler(
        &mut self,
        request_type: impl Into<String>,
        handler: Arc<dyn GlobalRequestHandler>,
    ) {
        self.global_router.register(request_type, handler);
    }

    pub fn set_password_callback(&mut self, callback: Arc<dyn PasswordAuth>) {
        self.auth.password = Some(callback);
    }

    pub fn set_public_key_callback(&mut self, callback: Arc<dyn PublicKeyAuth>) {
        self.auth.public_key = Some(callback);
    }

    pub fn set_keyboard_interactive_callback(
        &mut self,
        callback: Arc<dyn KeyboardInteractiveAuth>,
    ) {
        self.auth.keyboard_interactive = Some(callback);
    }

    pub fn set_auth_log_callback(&mut self, callback: Arc<dyn AuthLogCallback>) {
        self.auth.auth_log = Some(callback);
    }

    pub fn set_banner_callback(&mut self, callback: Arc<dyn BannerCallback>) {
        self.auth.banner = Some(callback);
    }

    pub fn set_user_lookup(&mut self, lookup: Arc<dyn UserLookup>) {
        self.user_lookup = Some(lookup);
    }

    pub fn set_transform_conn(&mut self, transform: Arc<dyn TransformConn>) {
        self.transform_conn = Some(transform);
    }

    pub fn set_handshake_error_callback(&mut self, callback: Arc<dyn HandshakeErrorCallback>) {
        self.handshake_error = Some(callback);
    }

    pub fn set_connect_callback(&mut self, callback: Arc<dyn ConnectCallback>) {
        self.on_connect = Some(callback);
    }

    /// The address the server is listening on, once it is.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    pub fn active_connections(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Bind `addr` and serve until the server is closed or shut down.
    pub async fn listen(
        self: &Arc<Self>,
        addr: impl std::net::ToSocketAddrs,
    ) -> Result<(), ServerError> {
        let listener = bind_tcp_listener(addr)
            .map_err(|error| ServerError::Resource(error.to_string()))?;
        self.serve(listener).await
    }

    /// Serve SSH on an already-bound listener.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        let transport_config = self.config.to_transport_config().await?;
        if let Ok(addr) = listener.local_addr() {
            *self.local_addr.lock().unwrap() = Some(addr);
        }
        info!(addr = ?self.local_addr(), version = %self.config.server_version(), "Server listening.");
        loop {
            let accepted = tokio::select! {
                _ = self.close_token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    warn!(%error, "Unable to accept connection.");
                    break;
                }
            };
            if let Err(error) = stream.set_nodelay(true) {
                warn!(%error, %peer, "Error setting nodelay.");
            }
            let stream = match self.transform_conn {
                Some(ref transform) => match transform.transform(stream, peer).await {
                    Ok(stream) => stream,
                    Err(error) => {
                        info!(%error, %peer, "Dropping connection: transform failed.");
                        continue;
                    }
                },
                None => stream,
            };
            self.handle_connection(stream, peer, Arc::clone(&transport_config));
        }
        *self.local_addr.lock().unwrap() = None;
        Ok(())
    }

    fn handle_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        transport_config: Arc<russh::server::Config>,
    ) {
        let id = self.session_counter.fetch_add(1, Ordering::AcqRel);
        let conn_token = self.root_token.child_token();
        let ctx = Arc::new(ConnectionContext::new(
            Arc::downgrade(self),
            conn_token.clone(),
        ));
        ctx.set_remote_addr(peer);
        if let Ok(addr) = stream.local_addr() {
            ctx.set_local_addr(addr);
        }
        ctx.set_server_version(self.config.server_version());
        info!(%peer, id, "Connection accepted.");
        let handler = ServerHandler::new(id, peer, Arc::clone(self), ctx);
        let server = Arc::clone(self);
        let close_token = self.close_token.clone();
        tokio::spawn(async move {
            let mut session =
                match russh::server::run_stream(transport_config, stream, handler).await {
                    Ok(session) => session,
                    Err(error) => {
                        if let Some(ref callback) = server.handshake_error {
                            callback.on_error(&error, peer);
                        }
                        info!(%error, %peer, "Handshake failed.");
                        return;
                    }
                };
            tokio::select! {
                result = &mut session => {
                    if let Err(error) = result {
                        info!(%error, %peer, "Connection closed.");
                    }
                }
                _ = conn_token.cancelled() => {
                    let _ = session
                        .handle()
                        .disconnect(russh::Disconnect::ByApplication, "".into(), "".into())
                        .await;
                }
                _ = close_token.cancelled() => {
                    let _ = session
                        .handle()
                        .disconnect(russh::Disconnect::ByApplication, "".into(), "".into())
                        .await;
                }
            }
            // The connection is gone; its context never outlives it.
            conn_token.cancel();
            server.remove_connection(id);
            info!(%peer, id, "Connection finished.");
        });
    }

    /// Pair the connection with its cancel token in the registry. Runs
    /// once authentication has succeeded and the context is populated.
    pub(crate) fn register_connection(&self, id: usize, token: CancellationToken, handle: Handle) {
        self.connections
            .lock()
            .unwrap()
            .insert(id, ConnectionEntry { token, handle });
    }

    /// Remove a connection and cancel its context, atomically with
    /// respect to the registry lock.
    pub(crate) fn remove_connection(&self, id: usize) {
        let mut connections = self.connections.lock().unwrap();
        if let Some(entry) = connections.remove(&id) {
            entry.token.cancel();
        }
    }

    /// Stop listening and disconnect every active connection. Contexts
    /// are not cancelled up front; handler tasks stop when their
    /// connection's teardown cancels them. Idempotent.
    pub async fn close(&self) -> Result<(), ServerError> {
        self.close_token.cancel();
        let entries: Vec<ConnectionEntry> = {
            let mut connections = self.connections.lock().unwrap();
            connections.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            // The connection task disconnects on close_token as well; a
            // failure here just means it got there first.
            let _ = entry
                .handle
                .disconnect(russh::Disconnect::ByApplication, "".into(), "".into())
                .await;
        }
        Ok(())
    }

    /// Cancel every connection context, then close. The cooperative
    /// path: handlers observing their context exit on their own.
    /// Idempotent.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        self.root_token.cancel();
        self.close().await
    }
}
