//! Remote port forwarding: `tcpip-forward` binds a listener on the
//! server and tunnels every accepted connection back to the client over
//! `forwarded-tcpip` channels; `cancel-tcpip-forward` releases it.

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    bind_addr::{BindAddress, BindAddressKey, BorrowedBindAddress},
    context::ConnectionContext,
    copy::copy_with_cancel,
    listener::bind_tcp_listener,
    router::{GlobalReply, GlobalRequest, GlobalRequestHandler},
    wire::ForwardRequest,
};

struct ForwardEntry {
    accept_task: JoinHandle<()>,
}

// The accept loop owns the listener, so removing an entry from the
// forwards map must take the socket down with it: aborting the loop here
// is what makes "deregistered" imply "no longer accepting" for both
// cancel-tcpip-forward and context cancellation.
impl Drop for ForwardEntry {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Global request handler for `tcpip-forward` and
/// `cancel-tcpip-forward`. Register it under both names.
pub struct TcpIpForwardHandler {
    buffer_size: usize,
    // Cancelling a binding that does not exist succeeds unless strict.
    strict_cancel: bool,
    forwards: Arc<DashMap<BindAddress, ForwardEntry>>,
}

impl TcpIpForwardHandler {
    pub fn new(buffer_size: usize) -> Self {
        TcpIpForwardHandler {
            buffer_size,
            strict_cancel: false,
            forwards: Arc::new(DashMap::new()),
        }
    }

    pub fn with_strict_cancellation(mut self) -> Self {
        self.strict_cancel = true;
        self
    }

    /// Number of live bindings, all connections included.
    pub fn active_bindings(&self) -> usize {
        self.forwards.len()
    }

    async fn bind(&self, ctx: Arc<ConnectionContext>, request: ForwardRequest) -> GlobalReply {
        let key = BindAddress(request.bind_addr.clone(), request.bind_port);
        if self.forwards.contains_key(&key) {
            info!(binding = %key, "Refusing tcpip-forward: already bound.");
            return GlobalReply::Denied;
        }
        let bind_host = match request.bind_addr.as_str() {
            // OpenSSH sends "" for "all interfaces" and "*" for
            // GatewayPorts-style binds.
            "" | "*" => "0.0.0.0",
            other => other,
        };
        let port = match u16::try_from(request.bind_port) {
            Ok(port) => port,
            Err(_) => {
                info!(port = request.bind_port, "Refusing tcpip-forward: invalid port.");
                return GlobalReply::Denied;
            }
        };
        let listener = match bind_tcp_listener((bind_host, port)) {
            Ok(listener) => listener,
            Err(error) => {
                info!(%error, binding = %key, "Refusing tcpip-forward: bind failed.");
                return GlobalReply::Denied;
            }
        };
        let assigned_port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(error) => {
                info!(%error, binding = %key, "Refusing tcpip-forward: no local address.");
                return GlobalReply::Denied;
            }
        };
        info!(binding = %key, assigned_port, "Serving tcpip-forward.");

        let accept_task = tokio::spawn(accept_loop(
            ctx,
            listener,
            key.clone(),
            Arc::clone(&self.forwards),
            assigned_port,
            self.buffer_size,
        ));
        self.forwards.insert(key, ForwardEntry { accept_task });
        GlobalReply::Accepted {
            bound_port: (request.bind_port == 0).then_some(assigned_port.into()),
        }
    }

    fn cancel(&self, request: &ForwardRequest) -> GlobalReply {
        let key: &dyn BindAddressKey =
            &BorrowedBindAddress(&request.bind_addr, &request.bind_port);
        // Removing the entry aborts the accept loop, which closes the
        // listener: the map never names a dead listener.
        match self.forwards.remove(key) {
            Some((key, _entry)) => {
                info!(binding = %key, "Cancelled tcpip-forward.");
                GlobalReply::Accepted { bound_port: None }
            }
            None if self.strict_cancel => GlobalReply::Denied,
            None => GlobalReply::Accepted { bound_port: None },
        }
    }
}

#[async_trait]
impl GlobalRequestHandler for TcpIpForwardHandler {
    async fn on_request(
        &self,
        ctx: Arc<ConnectionContext>,
        request: GlobalRequest,
    ) -> color_eyre::Result<GlobalReply> {
        match request {
            GlobalRequest::TcpIpForward(request) => Ok(self.bind(ctx, request).await),
            GlobalRequest::CancelTcpIpForward(request) => Ok(self.cancel(&request)),
        }
    }
}

// One loop per binding: accept, open a forwarded-tcpip back-channel with
// the original bind address and the port actually listened on, and pump
// bytes until either side closes or the context cancels.
async fn accept_loop(
    ctx: Arc<ConnectionContext>,
    listener: TcpListener,
    key: BindAddress,
    forwards: Arc<DashMap<BindAddress, ForwardEntry>>,
    assigned_port: u16,
    buffer_size: usize,
) {
    loop {
        let accepted = tokio::select! {
            _ = ctx.cancelled() => {
                // Deregister before the listener closes with this task.
                forwards.remove(&key);
                debug!(binding = %key, "Forward binding released by cancellation.");
                return;
            }
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(error) => {
                warn!(%error, binding = %key, "Forward listener accept failed.");
                forwards.remove(&key);
                return;
            }
        };
        let Some(handle) = ctx.handle() else {
            warn!(binding = %key, "No connection handle for forwarded-tcpip channel.");
            drop(stream);
            continue;
        };
        let ctx = Arc::clone(&ctx);
        let bind_addr = key.0.clone();
        tokio::spawn(serve_forwarded_connection(
            ctx,
            handle,
            stream,
            peer,
            bind_addr,
            assigned_port,
            buffer_size,
        ));
    }
}

async fn serve_forwarded_connection(
    ctx: Arc<ConnectionContext>,
    handle: russh::server::Handle,
    stream: TcpStream,
    peer: SocketAddr,
    bind_addr: String,
    assigned_port: u16,
    buffer_size: usize,
) {
    let channel = match handle
        .channel_open_forwarded_tcpip(
            bind_addr.clone(),
            assigned_port.into(),
            peer.ip().to_canonical().to_string(),
            peer.port().into(),
        )
        .await
    {
        Ok(channel) => channel,
        Err(error) => {
            warn!(%error, %peer, "Client refused forwarded-tcpip channel.");
            return;
        }
    };
    debug!(%peer, bind = %bind_addr, assigned_port, "Bridging forwarded connection.");
    let (mut tcp_read, mut tcp_write) = stream.into_split();
    let channel_stream = channel.into_stream();
    let (mut channel_read, mut channel_write) = tokio::io::split(channel_stream);
    let token = ctx.token().clone();
    let inbound_token = token.clone();
    let inbound = async move {
        let _ =
            copy_with_cancel(&mut tcp_read, &mut channel_write, buffer_size, &inbound_token).await;
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut channel_write).await;
    };
    let outbound = async move {
        let _ = copy_with_cancel(&mut channel_read, &mut tcp_write, buffer_size, &token).await;
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut tcp_write).await;
    };
    tokio::join!(inbound, outbound);
}
