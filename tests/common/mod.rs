//! Shared scaffolding: a loopback server authenticating `ferris` with a
//! fixed password, resolving every user to the account running the
//! tests so spawned processes need no privilege changes.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use hawser::{ConnMeta, PasswordAuth, Permissions, ServerConfig, SshServer, User, UserLookup};
use tokio::time::{sleep, timeout};

pub const TEST_USER: &str = "ferris";
pub const TEST_PASSWORD: &str = "hunter2";

pub struct FixedPassword;

#[async_trait]
impl PasswordAuth for FixedPassword {
    async fn authenticate(
        &self,
        _meta: &ConnMeta,
        password: &[u8],
    ) -> color_eyre::Result<Permissions> {
        if password == TEST_PASSWORD.as_bytes() {
            Ok(Permissions::default())
        } else {
            Err(color_eyre::eyre::eyre!("wrong password"))
        }
    }
}

pub struct CurrentUserLookup;

#[async_trait]
impl UserLookup for CurrentUserLookup {
    async fn lookup(&self, meta: &ConnMeta) -> color_eyre::Result<User> {
        Ok(User {
            username: meta.username.clone(),
            uid: nix::unistd::getuid().as_raw().to_string(),
            gid: nix::unistd::getgid().as_raw().to_string(),
            home_dir: "/".into(),
            shell: "/bin/sh".into(),
            ..Default::default()
        })
    }
}

pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.host_key_paths = vec![concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/data/server_keys/ssh_host_ed25519_key"
    )
    .into()];
    config.auth_rejection_delay = Duration::ZERO;
    config.auth_rejection_delay_initial = Some(Duration::ZERO);
    config
}

pub fn default_server() -> SshServer {
    let mut server = SshServer::new(test_config());
    server.set_password_callback(Arc::new(FixedPassword));
    server.set_user_lookup(Arc::new(CurrentUserLookup));
    server.install_default_handlers();
    server
}

pub async fn start_server_from(server: SshServer) -> (Arc<SshServer>, SocketAddr) {
    let server = Arc::new(server);
    let serving = Arc::clone(&server);
    tokio::spawn(async move { serving.listen(("127.0.0.1", 0)).await });
    let addr = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(addr) = server.local_addr() {
                return addr;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("timeout waiting for server to start");
    (server, addr)
}

pub async fn start_server() -> (Arc<SshServer>, SocketAddr) {
    start_server_from(default_server()).await
}

pub struct SshClient;

impl russh::client::Handler for SshClient {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub async fn connect(addr: SocketAddr) -> russh::client::Handle<SshClient> {
    let mut session = russh::client::connect(Default::default(), addr, SshClient)
        .await
        .expect("Failed to connect to SSH server");
    assert!(
        session
            .authenticate_password(TEST_USER, TEST_PASSWORD)
            .await
            .expect("SSH authentication failed")
            .success(),
        "authentication didn't succeed"
    );
    session
}
