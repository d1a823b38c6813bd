use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use russh::{
    client::{Msg, Session},
    Channel,
};
use tokio::{
    io::AsyncReadExt,
    net::TcpStream,
    time::{sleep, timeout},
};

mod common;

const GREETING: &[u8] = b"hello from the forwarding client";

// Client that serves every forwarded-tcpip channel with a greeting and
// records the destination port the server reported.
struct ForwardingClient {
    connected_port: Arc<Mutex<Option<u32>>>,
}

impl russh::client::Handler for ForwardingClient {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _connected_address: &str,
        connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        *self.connected_port.lock().unwrap() = Some(connected_port);
        tokio::spawn(async move {
            let _ = channel.data(GREETING).await;
            let _ = channel.eof().await;
            let _ = channel.close().await;
        });
        Ok(())
    }
}

// Remote forward with port 0: the reply carries the assigned port,
// external connections are tunneled back, and cancelling with the
// original port 0 releases the listener.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn remote_forward_assigns_port_and_cancels_with_requested_key() {
    let (_server, addr) = common::start_server().await;

    let connected_port = Arc::new(Mutex::new(None));
    let client = ForwardingClient {
        connected_port: Arc::clone(&connected_port),
    };
    let mut session = russh::client::connect(Default::default(), addr, client)
        .await
        .expect("Failed to connect to SSH server");
    assert!(
        session
            .authenticate_password(common::TEST_USER, common::TEST_PASSWORD)
            .await
            .expect("SSH authentication failed")
            .success(),
        "authentication didn't succeed"
    );

    let port = session
        .tcpip_forward("127.0.0.1", 0)
        .await
        .expect("tcpip_forward failed");
    let port = u16::try_from(port).expect("should be a valid port number");
    assert!(port >= 1024, "assigned port must not be privileged");

    // An external process connects to the bound port and receives the
    // client's greeting end-to-end.
    let mut stream = timeout(Duration::from_secs(5), TcpStream::connect(("127.0.0.1", port)))
        .await
        .expect("connect timed out")
        .expect("TCP connection failed");
    let mut received = Vec::new();
    timeout(Duration::from_secs(10), stream.read_to_end(&mut received))
        .await
        .expect("read timed out")
        .expect("read failed");
    assert_eq!(received, GREETING);
    // The back-channel names the port that was actually bound.
    assert_eq!(*connected_port.lock().unwrap(), Some(port.into()));

    // Cancellation uses the original bind key, port 0 included.
    session
        .cancel_tcpip_forward("127.0.0.1", 0)
        .await
        .expect("cancel_tcpip_forward failed");
    sleep(Duration::from_millis(100)).await;
    assert!(
        TcpStream::connect(("127.0.0.1", port)).await.is_err(),
        "listener must be closed after cancellation"
    );
}

// Disconnecting the SSH connection cancels its context and releases the
// forward binding without an explicit cancel request.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn disconnect_releases_forward_bindings() {
    let (server, addr) = common::start_server().await;

    let client = ForwardingClient {
        connected_port: Arc::new(Mutex::new(None)),
    };
    let mut session = russh::client::connect(Default::default(), addr, client)
        .await
        .expect("Failed to connect to SSH server");
    assert!(
        session
            .authenticate_password(common::TEST_USER, common::TEST_PASSWORD)
            .await
            .expect("SSH authentication failed")
            .success()
    );
    let port = session
        .tcpip_forward("127.0.0.1", 0)
        .await
        .expect("tcpip_forward failed");
    let port = u16::try_from(port).unwrap();

    session
        .disconnect(russh::Disconnect::ByApplication, "", "")
        .await
        .expect("disconnect failed");

    timeout(Duration::from_secs(5), async {
        while server.active_connections() > 0 {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("connection was not deregistered");
    sleep(Duration::from_millis(100)).await;
    assert!(
        TcpStream::connect(("127.0.0.1", port)).await.is_err(),
        "listener must be closed after the connection ends"
    );
}
