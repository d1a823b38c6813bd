use std::time::Duration;

use russh::{ChannelMsg, Sig};
use tokio::time::{sleep, timeout};

mod common;

// A long-running exec is interrupted by a client-sent INT and the
// non-zero exit status makes it back.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn signal_interrupts_a_running_exec() {
    let (_server, addr) = common::start_server().await;
    let session = common::connect(addr).await;

    let mut channel = session
        .channel_open_session()
        .await
        .expect("channel open failed");
    channel.exec(true, "sleep 60").await.expect("exec failed");
    // Give the child a moment to spawn before signalling.
    sleep(Duration::from_millis(500)).await;
    channel.signal(Sig::INT).await.expect("signal send failed");

    let mut exit_status = None;
    timeout(Duration::from_secs(10), async {
        while let Some(msg) = channel.wait().await {
            if let ChannelMsg::ExitStatus {
                exit_status: status,
            } = msg
            {
                exit_status = Some(status);
            }
        }
    })
    .await
    .expect("timed out waiting for the signalled exit");

    // 128 + SIGINT.
    assert_eq!(exit_status, Some(130));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn unknown_signal_names_are_ignored() {
    let (_server, addr) = common::start_server().await;
    let session = common::connect(addr).await;

    let mut channel = session
        .channel_open_session()
        .await
        .expect("channel open failed");
    channel
        .exec(true, "sh -c 'sleep 1; echo survived'")
        .await
        .expect("exec failed");
    sleep(Duration::from_millis(300)).await;
    channel
        .signal(Sig::Custom("NOSUCHSIG".into()))
        .await
        .expect("signal send failed");

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
    .expect("timed out waiting for exec output");

    assert_eq!(stdout, b"survived\n");
    assert_eq!(exit_status, Some(0));
}
