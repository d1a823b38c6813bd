//! Registries dispatching client-opened channels and connection-global
//! requests to pluggable handlers, keyed by RFC 4254 type name.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use russh::{server::Msg, Channel};
use tracing::debug;

use crate::{
    context::ConnectionContext,
    wire::{
        DirectTcpIpParams, ForwardRequest, ForwardedTcpIpParams, CHANNEL_TYPE_DIRECT_TCPIP,
        CHANNEL_TYPE_FORWARDED_TCPIP, CHANNEL_TYPE_SESSION, CHANNEL_TYPE_X11,
        GLOBAL_REQUEST_CANCEL_TCPIP_FORWARD, GLOBAL_REQUEST_TCPIP_FORWARD,
    },
};

/// A new-channel request as the transport hands it over, already typed
/// and with its extra data parsed.
#[derive(Debug, Clone)]
pub enum ChannelOpen {
    Session,
    DirectTcpIp(DirectTcpIpParams),
    X11 { orig_host: String, orig_port: u32 },
    ForwardedTcpIp(ForwardedTcpIpParams),
}

impl ChannelOpen {
    pub fn type_name(&self) -> &'static str {
        match self {
            ChannelOpen::Session => CHANNEL_TYPE_SESSION,
            ChannelOpen::DirectTcpIp(_) => CHANNEL_TYPE_DIRECT_TCPIP,
            ChannelOpen::X11 { .. } => CHANNEL_TYPE_X11,
            ChannelOpen::ForwardedTcpIp(_) => CHANNEL_TYPE_FORWARDED_TCPIP,
        }
    }
}

/// Serves channels of one type. Returning `Ok(false)` refuses the open;
/// the connection stays up. A handler that accepts is expected to spawn
/// whatever tasks serve the channel and return promptly.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    async fn on_open(
        &self,
        ctx: Arc<ConnectionContext>,
        channel: Channel<Msg>,
        open: ChannelOpen,
    ) -> color_eyre::Result<bool>;
}

/// A connection-global request, parsed.
#[derive(Debug, Clone)]
pub enum GlobalRequest {
    TcpIpForward(ForwardRequest),
    CancelTcpIpForward(ForwardRequest),
}

impl GlobalRequest {
    pub fn type_name(&self) -> &'static str {
        match self {
            GlobalRequest::TcpIpForward(_) => GLOBAL_REQUEST_TCPIP_FORWARD,
            GlobalRequest::CancelTcpIpForward(_) => GLOBAL_REQUEST_CANCEL_TCPIP_FORWARD,
        }
    }
}

/// Reply to a global request. For `want-reply` requests the dispatch
/// turns this into the wire-level success/failure; a handler that denies
/// must still return (never leave the client hanging).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalReply {
    /// Accept; for `tcpip-forward` with port 0 this carries the port the
    /// OS assigned, which the reply payload communicates back.
    Accepted { bound_port: Option<u32> },
    Denied,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GlobalRequestHandler: Send + Sync {
    async fn on_request(
        &self,
        ctx: Arc<ConnectionContext>,
        request: GlobalRequest,
    ) -> color_eyre::Result<GlobalReply>;
}

/// Channel-type name → handler. No registered handler means every open of
/// that type is refused.
#[derive(Default)]
pub struct ChannelRouter {
    handlers: HashMap<String, Arc<dyn ChannelHandler>>,
}

impl ChannelRouter {
    pub fn register(&mut self, channel_type: impl Into<String>, handler: Arc<dyn ChannelHandler>) {
        self.handlers.insert(channel_type.into(), handler);
    }

    pub(crate) async fn dispatch(
        &self,
        ctx: Arc<ConnectionContext>,
        channel: Channel<Msg>,
        open: ChannelOpen,
    ) -> bool {
        let channel_type = open.type_name();
        let Some(handler) = self.handlers.get(channel_type) else {
            debug!(%channel_type, "Refusing channel: no handler registered.");
            return false;
        };
        match handler.on_open(ctx, channel, open).await {
            Ok(accepted) => accepted,
            Err(error) => {
                debug!(%error, %channel_type, "Channel handler failed; refusing open.");
                false
            }
        }
    }
}

/// Global-request name → handler. No registered handler rejects every
/// request that wants a reply.
#[derive(Default)]
pub struct GlobalRequestRouter {
    handlers: HashMap<String, Arc<dyn GlobalRequestHandler>>,
}

impl GlobalRequestRouter {
    pub fn register(
        &mut self,
        request_type: impl Into<String>,
        handler: Arc<dyn GlobalRequestHandler>,
    ) {
        self.handlers.insert(request_type.into(), handler);
    }

    pub(crate) async fn dispatch(
        &self,
        ctx: Arc<ConnectionContext>,
        request: GlobalRequest,
    ) -> GlobalReply {
        let request_type = request.type_name();
        let Some(handler) = self.handlers.get(request_type) else {
            debug!(%request_type, "Denying global request: no handler registered.");
            return GlobalReply::Denied;
        };
        match handler.on_request(ctx, request).await {
            Ok(reply) => reply,
            Err(error) => {
                debug!(%error, %request_type, "Global request handler failed; denying.");
                GlobalReply::Denied
            }
        }
    }
}
