//! Outbound TCP dialing on behalf of the client (`direct-tcpip`).

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use russh::{server::Msg, Channel};
use tokio::{
    io::{copy_bidirectional_with_sizes, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tracing::{debug, info};

use crate::{
    context::ConnectionContext,
    copy::DEFAULT_BUFFER_SIZE,
    router::{ChannelHandler, ChannelOpen},
    wire::DirectTcpIpParams,
};

/// Channel handler for `direct-tcpip`: dial the destination the client
/// names, then pump bytes both ways until either side closes or the
/// connection context is cancelled. Channel requests on the open channel
/// are discarded by the transport.
pub struct DirectTcpIpHandler {
    dial_timeout: Option<Duration>,
    buffer_size: usize,
}

impl DirectTcpIpHandler {
    /// `dial_timeout` of `None` leaves connecting to the platform;
    /// `buffer_size` of 0 selects the copier default.
    pub fn new(dial_timeout: Option<Duration>, buffer_size: usize) -> Self {
        DirectTcpIpHandler {
            dial_timeout,
            buffer_size: match buffer_size {
                0 => DEFAULT_BUFFER_SIZE,
                n => n,
            },
        }
    }
}

#[async_trait]
impl ChannelHandler for DirectTcpIpHandler {
    async fn on_open(
        &self,
        ctx: Arc<ConnectionContext>,
        channel: Channel<Msg>,
        open: ChannelOpen,
    ) -> color_eyre::Result<bool> {
        let ChannelOpen::DirectTcpIp(params) = open else {
            return Ok(false);
        };
        let DirectTcpIpParams {
            dest_host,
            dest_port,
            orig_host,
            orig_port,
        } = params;
        let dest = format!("{dest_host}:{dest_port}");
        // Dial before accepting, so a failure refuses the channel open
        // instead of closing a half-built pipe.
        let dial = TcpStream::connect(&dest);
        let stream = match self.dial_timeout {
            Some(duration) => match timeout(duration, dial).await {
                Ok(result) => result,
                Err(_) => {
                    info!(%dest, "Refusing direct-tcpip: dial timed out.");
                    return Ok(false);
                }
            },
            None => dial.await,
        };
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(error) => {
                info!(%error, %dest, "Refusing direct-tcpip: dial failed.");
                return Ok(false);
            }
        };
        info!(%dest, origin = %format!("{orig_host}:{orig_port}"), "Serving direct-tcpip.");
        let buffer_size = self.buffer_size;
        tokio::spawn(async move {
            let mut channel_stream = channel.into_stream();
            tokio::select! {
                result = copy_bidirectional_with_sizes(
                    &mut stream,
                    &mut channel_stream,
                    buffer_size,
                    buffer_size,
                ) => {
                    if let Err(error) = result {
                        debug!(%error, %dest, "Direct-tcpip stream ended.");
                    }
                }
                _ = ctx.cancelled() => {}
            }
            let _ = stream.shutdown().await;
            let _ = channel_stream.shutdown().await;
        });
        Ok(true)
    }
}
