use std::time::Duration;

use russh::ChannelMsg;
use tokio::time::timeout;

mod common;

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn exec_streams_stdout_and_reports_exit_status() {
    let (_server, addr) = common::start_server().await;
    let session = common::connect(addr).await;

    let mut channel = session
        .channel_open_session()
        .await
        .expect("channel open failed");
    channel.exec(true, "echo hello").await.expect("exec failed");

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

    assert_eq!(stdout, b"hello\n");
    assert_eq!(exit_status, Some(0));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn exec_failure_exit_codes_are_conveyed() {
    let (_server, addr) = common::start_server().await;
    let session = common::connect(addr).await;

    let mut channel = session
        .channel_open_session()
        .await
        .expect("channel open failed");
    channel
        .exec(true, "sh -c 'exit 42'")
        .await
        .expect("exec failed");

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
    .expect("timed out waiting for exit status");

    assert_eq!(exit_status, Some(42));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn exec_stderr_arrives_as_extended_data() {
    let (_server, addr) = common::start_server().await;
    let session = common::connect(addr).await;

    let mut channel = session
        .channel_open_session()
        .await
        .expect("channel open failed");
    channel
        .exec(true, "sh -c 'echo oops >&2'")
        .await
        .expect("exec failed");

    let mut stderr = Vec::new();
    let mut stdout = Vec::new();
    timeout(Duration::from_secs(10), async {
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                _ => {}
            }
        }
    })
    .await
    .expect("timed out waiting for stderr");

    assert_eq!(stderr, b"oops\n");
    assert!(stdout.is_empty());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn empty_exec_command_is_refused() {
    let (_server, addr) = common::start_server().await;
    let session = common::connect(addr).await;

    let mut channel = session
        .channel_open_session()
        .await
        .expect("channel open failed");
    channel.exec(true, "").await.expect("request send failed");

    let refused = timeout(Duration::from_secs(10), async {
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Failure) => return true,
                Some(ChannelMsg::Success) => return false,
                Some(_) => {}
                None => return false,
            }
        }
    })
    .await
    .expect("timed out waiting for reply");
    assert!(refused, "empty exec must be refused");
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn exec_stdin_reaches_the_child() {
    let (_server, addr) = common::start_server().await;
    let session = common::connect(addr).await;

    let mut channel = session
        .channel_open_session()
        .await
        .expect("channel open failed");
    channel.exec(true, "cat").await.expect("exec failed");
    channel
        .data(&b"echoed through cat"[..])
        .await
        .expect("data send failed");
    channel.eof().await.expect("eof failed");

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
    .expect("timed out waiting for cat output");

    assert_eq!(stdout, b"echoed through cat");
    assert_eq!(exit_status, Some(0));
}
