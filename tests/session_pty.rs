use std::time::Duration;

use russh::ChannelMsg;
use tokio::time::timeout;

mod common;

// An exec preceded by a pty-req runs on a pty with TERM applied.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn pty_exec_attaches_a_controlling_terminal() {
    let (_server, addr) = common::start_server().await;
    let session = common::connect(addr).await;

    let mut channel = session
        .channel_open_session()
        .await
        .expect("channel open failed");
    channel
        .request_pty(true, "xterm", 80, 24, 0, 0, &[])
        .await
        .expect("pty request failed");
    channel
        .exec(true, r#"sh -c 'test -t 0 && echo "tty:$TERM"'"#)
        .await
        .expect("exec failed");

    let mut stdout = Vec::new();
    let mut exit_status = None;
    timeout(Duration::from_secs(10), async {
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExitStatus {
                    exit_status: status,
                } => exit_status = Some(status),
                _ => {}
            }
        }
    })
    .await
    .expect("timed out waiting for pty output");

    let output = String::from_utf8_lossy(&stdout);
    assert!(
        output.contains("tty:xterm"),
        "expected a tty with TERM=xterm, got {output:?}"
    );
    assert_eq!(exit_status, Some(0));
}

// A window-change sent while the process runs resizes the pty.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn window_change_resizes_the_pty() {
    let (_server, addr) = common::start_server().await;
    let session = common::connect(addr).await;

    let mut channel = session
        .channel_open_session()
        .await
        .expect("channel open failed");
    channel
        .request_pty(true, "xterm", 80, 24, 0, 0, &[])
        .await
        .expect("pty request failed");
    channel
        .exec(true, "sh -c 'sleep 1; stty size'")
        .await
        .expect("exec failed");
    tokio::time::sleep(Duration::from_millis(300)).await;
    channel
        .window_change(132, 43, 0, 0)
        .await
        .expect("window change failed");

    let mut stdout = Vec::new();
    timeout(Duration::from_secs(10), async {
        while let Some(msg) = channel.wait().await {
            if let ChannelMsg::Data { data } = msg {
                stdout.extend_from_slice(&data);
            }
        }
    })
    .await
    .expect("timed out waiting for stty output");

    let output = String::from_utf8_lossy(&stdout);
    assert!(
        output.contains("43 132"),
        "expected the resized dimensions, got {output:?}"
    );
}

// The pty reflects the dimensions of the pty-req that preceded exec.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn pty_is_allocated_with_requested_dimensions() {
    let (_server, addr) = common::start_server().await;
    let session = common::connect(addr).await;

    let mut channel = session
        .channel_open_session()
        .await
        .expect("channel open failed");
    channel
        .request_pty(true, "xterm", 132, 43, 0, 0, &[])
        .await
        .expect("pty request failed");
    channel
        .exec(true, "stty size")
        .await
        .expect("exec failed");

    let mut stdout = Vec::new();
    timeout(Duration::from_secs(10), async {
        while let Some(msg) = channel.wait().await {
            if let ChannelMsg::Data { data } = msg {
                stdout.extend_from_slice(&data);
            }
        }
    })
    .await
    .expect("timed out waiting for stty output");

    let output = String::from_utf8_lossy(&stdout);
    assert!(
        output.contains("43 132"),
        "expected a 132x43 pty, got {output:?}"
    );
}
