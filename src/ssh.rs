//! Per-connection transport handler: maps the transport's auth and
//! dispatch callbacks onto the server's callback surface and routers.

use std::{borrow::Cow, collections::HashSet, net::SocketAddr, sync::Arc};

use russh::{
    keys::PublicKey,
    server::{Auth, Handler, Msg, Response, Session},
    Channel, ChannelId, MethodSet, Sig,
};
use tracing::{debug, info, warn};

use crate::{
    auth::{ConnMeta, KbdInteractiveStep, Permissions},
    context::ConnectionContext,
    router::{ChannelOpen, GlobalReply, GlobalRequest},
    server::SshServer,
    wire::{DirectTcpIpParams, ForwardRequest, ForwardedTcpIpParams},
};

const METHOD_PASSWORD: &str = "password";
const METHOD_PUBLICKEY: &str = "publickey";
const METHOD_KEYBOARD_INTERACTIVE: &str = "keyboard-interactive";
const METHOD_NONE: &str = "none";

pub(crate) struct ServerHandler {
    id: usize,
    peer: SocketAddr,
    server: Arc<SshServer>,
    ctx: Arc<ConnectionContext>,
    username: Option<String>,
    // Round counter for the keyboard-interactive challenger.
    kbd_round: u32,
    // Channels this connection opened as sessions, so channel requests
    // on other channel types are refused.
    session_channels: HashSet<ChannelId>,
}

impl ServerHandler {
    pub(crate) fn new(
        id: usize,
        peer: SocketAddr,
        server: Arc<SshServer>,
        ctx: Arc<ConnectionContext>,
    ) -> Self {
        ServerHandler {
            id,
            peer,
            server,
            ctx,
            username: None,
            kbd_round: 0,
            session_channels: HashSet::new(),
        }
    }

    fn meta(&self, username: &str) -> ConnMeta {
        ConnMeta {
            username: username.to_string(),
            remote_addr: Some(self.peer),
            local_addr: self.ctx.local_addr(),
        }
    }

    fn reject(&self) -> Auth {
        let methods = self.server.auth.method_kinds();
        Auth::Reject {
            proceed_with_methods: (!methods.is_empty())
                .then(|| MethodSet::from(methods.as_slice())),
            partial_success: false,
        }
    }

    fn accept(&mut self, username: &str, permissions: Permissions) -> Auth {
        self.username = Some(username.to_string());
        self.ctx.set_permissions(permissions);
        Auth::Accept
    }
}

impl Handler for ServerHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        self.server
            .auth
            .log_attempt(&self.meta(user), METHOD_NONE, Some("not supported"));
        Ok(self.reject())
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let meta = self.meta(user);
        let Some(callback) = self.server.auth.password.clone() else {
            self.server
                .auth
                .log_attempt(&meta, METHOD_PASSWORD, Some("no password callback"));
            return Ok(self.reject());
        };
        match callback.authenticate(&meta, password.as_bytes()).await {
            Ok(permissions) => {
                self.server.auth.log_attempt(&meta, METHOD_PASSWORD, None);
                info!(%user, peer = %self.peer, "Password authentication succeeded.");
                Ok(self.accept(user, permissions))
            }
            Err(error) => {
                self.server
                    .auth
                    .log_attempt(&meta, METHOD_PASSWORD, Some(&error.to_string()));
                warn!(%user, peer = %self.peer, "Password authentication failed.");
                Ok(self.reject())
            }
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let meta = self.meta(user);
        let Some(callback) = self.server.auth.public_key.clone() else {
            self.server
                .auth
                .log_attempt(&meta, METHOD_PUBLICKEY, Some("no public key callback"));
            return Ok(self.reject());
        };
        match callback.authenticate(&meta, public_key).await {
            Ok(permissions) => {
                self.server.auth.log_attempt(&meta, METHOD_PUBLICKEY, None);
                info!(%user, peer = %self.peer, "Public key authentication succeeded.");
                Ok(self.accept(user, permissions))
            }
            Err(error) => {
                self.server
                    .auth
                    .log_attempt(&meta, METHOD_PUBLICKEY, Some(&error.to_string()));
                warn!(%user, peer = %self.peer, "Public key authentication failed.");
                Ok(self.reject())
            }
        }
    }

    async fn auth_keyboard_interactive(
        &mut self,
        user: &str,
        _submethods: &str,
        response: Option<Response<'_>>,
    ) -> Result<Auth, Self::Error> {
        let meta = self.meta(user);
        let Some(callback) = self.server.auth.keyboard_interactive.clone() else {
            self.server.auth.log_attempt(
                &meta,
                METHOD_KEYBOARD_INTERACTIVE,
                Some("no keyboard-interactive callback"),
            );
            return Ok(self.reject());
        };
        let answers: Vec<String> = response
            .map(|response| {
                response
                    .map(|answer| String::from_utf8_lossy(&answer).into_owned())
                    .collect()
            })
            .unwrap_or_default();
        let round = self.kbd_round;
        match callback.challenge(&meta, round, answers).await {
            Ok(KbdInteractiveStep::Questions {
                name,
                instructions,
                prompts,
            }) => {
                self.kbd_round += 1;
                let prompts: Vec<(Cow<'static, str>, bool)> = prompts
                    .into_iter()
                    .map(|(prompt, echo)| (Cow::Owned(prompt), echo))
                    .collect();
                Ok(Auth::Partial {
                    name: Cow::Owned(name),
                    instructions: Cow::Owned(instructions),
                    prompts: Cow::Owned(prompts),
                })
            }
            Ok(KbdInteractiveStep::Accept(permissions)) => {
                self.server
                    .auth
                    .log_attempt(&meta, METHOD_KEYBOARD_INTERACTIVE, None);
                Ok(self.accept(user, permissions))
            }
            Ok(KbdInteractiveStep::Reject) => {
                self.server.auth.log_attempt(
                    &meta,
                    METHOD_KEYBOARD_INTERACTIVE,
                    Some("challenge rejected"),
                );
                Ok(self.reject())
            }
            Err(error) => {
                self.server.auth.log_attempt(
                    &meta,
                    METHOD_KEYBOARD_INTERACTIVE,
                    Some(&error.to_string()),
                );
                Ok(self.reject())
            }
        }
    }

    async fn authentication_banner(&mut self) -> Result<Option<String>, Self::Error> {
        let Some(callback) = self.server.auth.banner.clone() else {
            return Ok(None);
        };
        let meta = self.meta(self.username.as_deref().unwrap_or(""));
        Ok(callback.banner(&meta).await)
    }

    // Authentication is done: look the user up, finish populating the
    // context, run the connect log callback, and register the
    // connection.
    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<(), Self::Error> {
        self.ctx.set_handle(session.handle());
        self.ctx
            .set_client_version(String::from_utf8_lossy(session.remote_sshid()).into_owned());
        let username = self.username.clone().unwrap_or_default();
        if let Some(lookup) = self.server.user_lookup.clone() {
            match lookup.lookup(&self.meta(&username)).await {
                Ok(user) => self.ctx.set_user(user),
                Err(error) => {
                    warn!(%error, user = %username, "User lookup failed; disconnecting.");
                    return Err(russh::Error::Disconnect);
                }
            }
        }
        if let Some(callback) = self.server.on_connect.clone() {
            if let Err(error) = callback.on_connect(&self.ctx).await {
                warn!(%error, "Connect callback refused connection.");
                return Err(russh::Error::Disconnect);
            }
        }
        self.server
            .register_connection(self.id, self.ctx.token().clone(), session.handle());
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let channel_id = channel.id();
        let accepted = self
            .server
            .channel_router
            .dispatch(Arc::clone(&self.ctx), channel, ChannelOpen::Session)
            .await;
        if accepted {
            self.session_channels.insert(channel_id);
        }
        Ok(accepted)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let open = ChannelOpen::DirectTcpIp(DirectTcpIpParams {
            dest_host: host_to_connect.to_string(),
            dest_port: port_to_connect,
            orig_host: originator_address.to_string(),
            orig_port: originator_port,
        });
        Ok(self
            .server
            .channel_router
            .dispatch(Arc::clone(&self.ctx), channel, open)
            .await)
    }

    async fn channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let open = ChannelOpen::X11 {
            orig_host: originator_address.to_string(),
            orig_port: originator_port,
        };
        Ok(self
            .server
            .channel_router
            .dispatch(Arc::clone(&self.ctx), channel, open)
            .await)
    }

    // Client-opened forwarded-tcpip channels are backwards; they are
    // refused unless the embedder registers a handler for them.
    async fn channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let open = ChannelOpen::ForwardedTcpIp(ForwardedTcpIpParams {
            dest_addr: host_to_connect.to_string(),
            dest_port: port_to_connect,
            orig_addr: originator_address.to_string(),
            orig_port: originator_port,
        });
        Ok(self
            .server
            .channel_router
            .dispatch(Arc::clone(&self.ctx), channel, open)
            .await)
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.session_channels.remove(&channel);
        Ok(())
    }

    // Channel request replies are sent here, synchronously with the
    // transport's reply accounting; the session task receives the same
    // requests through the channel's message stream and acts on them.

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.session_channels.contains(&channel) {
            session.channel_success(channel)
        } else {
            session.channel_failure(channel)
        }
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        _variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.session_channels.contains(&channel) {
            session.channel_success(channel)
        } else {
            session.channel_failure(channel)
        }
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // window-change needs no reply per the RFC; confirm anyway for
        // clients that ask.
        if self.session_channels.contains(&channel) {
            session.channel_success(channel)
        } else {
            session.channel_failure(channel)
        }
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.session_channels.contains(&channel) && self.ctx.user().is_some() {
            session.channel_success(channel)
        } else {
            session.channel_failure(channel)
        }
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data);
        let parsed = shell_words::split(&command);
        let acceptable = self.session_channels.contains(&channel)
            && matches!(parsed, Ok(ref words) if !words.is_empty());
        if acceptable {
            session.channel_success(channel)
        } else {
            debug!(%command, "Refusing exec request.");
            session.channel_failure(channel)
        }
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(%name, "Subsystems are not implemented.");
        session.channel_failure(channel)
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("X11 forwarding is not implemented.");
        session.channel_failure(channel)
    }

    async fn agent_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("Agent forwarding is not implemented.");
        session.channel_failure(channel)?;
        Ok(false)
    }

    async fn signal(
        &mut self,
        _channel: ChannelId,
        _signal: Sig,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Delivered to the session task via the channel stream; signal
        // requests carry no reply.
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let request = GlobalRequest::TcpIpForward(ForwardRequest {
            bind_addr: address.to_string(),
            bind_port: *port,
        });
        match self
            .server
            .global_router
            .dispatch(Arc::clone(&self.ctx), request)
            .await
        {
            GlobalReply::Accepted { bound_port } => {
                if let Some(bound_port) = bound_port {
                    *port = bound_port;
                }
                Ok(true)
            }
            GlobalReply::Denied => Ok(false),
        }
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let request = GlobalRequest::CancelTcpIpForward(ForwardRequest {
            bind_addr: address.to_string(),
            bind_port: port,
        });
        match self
            .server
            .global_router
            .dispatch(Arc::clone(&self.ctx), request)
            .await
        {
            GlobalReply::Accepted { .. } => Ok(true),
            GlobalReply::Denied => Ok(false),
        }
    }
}
