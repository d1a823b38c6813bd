//! Server configuration: host keys, version string, preferred algorithms,
//! and the knobs consumed by the session and forwarding handlers.

use std::{borrow::Cow, path::PathBuf, sync::Arc, time::Duration};

use russh::{cipher, kex, keys::PrivateKey, mac, Preferred, SshId};
use tracing::{debug, warn};

use crate::error::ServerError;

const VERSION_2_PREFIX: &str = "SSH-2.0-";
const VERSION_1_PREFIX: &str = "SSH-1.0-";

// OpenSSH host key locations, tried in order of preference.
pub const DEFAULT_HOST_KEY_PATHS: &[&str] = &[
    "/etc/ssh/ssh_host_ed25519_key",
    "/etc/ssh/ssh_host_rsa_key",
    "/etc/ssh/ssh_host_ecdsa_key",
    "/etc/ssh/ssh_host_dsa_key",
];

/// Queue capacity for the session pty/window-change/signal queues. Small
/// capacities back-pressure the dispatch task; below 4 a client bursting
/// window-change messages can deadlock a session whose drains have not
/// started yet. 1 is the hard minimum.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host key files. Missing files are skipped with a warning; at least
    /// one key must load (or be supplied via `host_keys`).
    pub host_key_paths: Vec<PathBuf>,
    /// Host keys supplied in memory, appended after the file-loaded ones.
    pub host_keys: Vec<PrivateKey>,
    /// The identification string sent to clients.
    server_version: String,
    /// Delay applied before replying to a failed authentication attempt.
    pub auth_rejection_delay: Duration,
    /// Delay override for the client's initial method probe.
    pub auth_rejection_delay_initial: Option<Duration>,
    pub inactivity_timeout: Option<Duration>,
    pub keepalive_interval: Option<Duration>,
    pub keepalive_max: usize,
    /// Copy buffer size for session and forwarding byte pumps. 0 selects
    /// the copier default of 32 KiB.
    pub buffer_size: usize,
    /// Capacity of each session request queue.
    pub queue_capacity: usize,
    /// Dial timeout for `direct-tcpip` channels. `None` means no timeout.
    pub dial_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host_key_paths: DEFAULT_HOST_KEY_PATHS.iter().map(PathBuf::from).collect(),
            host_keys: Vec::new(),
            server_version: format!(
                "{}hawser_{}",
                VERSION_2_PREFIX,
                env!("CARGO_PKG_VERSION")
            ),
            auth_rejection_delay: Duration::from_secs(2),
            auth_rejection_delay_initial: Some(Duration::from_secs(0)),
            inactivity_timeout: Some(Duration::from_secs(3_600)),
            keepalive_interval: Some(Duration::from_secs(15)),
            keepalive_max: 4,
            buffer_size: 0,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            dial_timeout: None,
        }
    }
}

impl ServerConfig {
    /// Set the version string as `SSH-<major>.0-<suffix>`. Major 1 is
    /// accepted for legacy labeling but the transport only negotiates
    /// SSH-2; any other major selects SSH-2.
    pub fn set_version(&mut self, major: u8, suffix: &str) {
        let prefix = if major == 1 {
            VERSION_1_PREFIX
        } else {
            VERSION_2_PREFIX
        };
        self.server_version = format!("{prefix}{suffix}");
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Load the configured host keys. Unreadable paths are skipped so a
    /// partial OpenSSH key directory still works; an empty result is an
    /// error.
    pub(crate) async fn load_host_keys(&self) -> Result<Vec<PrivateKey>, ServerError> {
        let mut keys = Vec::new();
        for path in &self.host_key_paths {
            match tokio::fs::read_to_string(path).await {
                Ok(pem) => match russh::keys::decode_secret_key(&pem, None) {
                    Ok(key) => {
                        debug!(path = %path.display(), "Loaded host key.");
                        keys.push(key);
                    }
                    Err(error) => {
                        warn!(%error, path = %path.display(), "Skipping undecodable host key.");
                    }
                },
                Err(error) => {
                    debug!(%error, path = %path.display(), "Skipping unreadable host key.");
                }
            }
        }
        keys.extend(self.host_keys.iter().cloned());
        if keys.is_empty() {
            return Err(ServerError::NoHostKeys);
        }
        Ok(keys)
    }

    pub(crate) async fn to_transport_config(
        &self,
    ) -> Result<Arc<russh::server::Config>, ServerError> {
        let keys = self.load_host_keys().await?;
        Ok(Arc::new(russh::server::Config {
            server_id: SshId::Standard(self.server_version.clone()),
            auth_rejection_time: self.auth_rejection_delay,
            auth_rejection_time_initial: self.auth_rejection_delay_initial,
            inactivity_timeout: self.inactivity_timeout,
            keepalive_interval: self.keepalive_interval,
            keepalive_max: self.keepalive_max,
            keys,
            preferred: preferred_algorithms(),
            ..Default::default()
        }))
    }
}

// The negotiation preference lists. The transport supports more; these
// orderings put AEAD ciphers, curve25519, and encrypt-then-MAC first.
fn preferred_algorithms() -> Preferred {
    Preferred {
        kex: Cow::Borrowed(&[
            kex::CURVE25519,
            kex::CURVE25519_PRE_RFC_8731,
            kex::ECDH_SHA2_NISTP256,
            kex::ECDH_SHA2_NISTP384,
            kex::ECDH_SHA2_NISTP521,
            kex::DH_G14_SHA256,
            kex::DH_G14_SHA1,
            kex::EXTENSION_SUPPORT_AS_SERVER,
        ]),
        cipher: Cow::Borrowed(&[
            cipher::AES_128_GCM,
            cipher::CHACHA20_POLY1305,
            cipher::AES_128_CTR,
            cipher::AES_192_CTR,
            cipher::AES_256_CTR,
        ]),
        mac: Cow::Borrowed(&[mac::HMAC_SHA256_ETM, mac::HMAC_SHA256, mac::HMAC_SHA1]),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::ServerConfig;
    use crate::error::ServerError;

    #[test]
    fn default_version_is_ssh2() {
        let config = ServerConfig::default();
        assert!(config.server_version().starts_with("SSH-2.0-hawser_"));
    }

    #[test]
    fn set_version_covers_both_majors() {
        let mut config = ServerConfig::default();
        config.set_version(1, "relic");
        assert_eq!(config.server_version(), "SSH-1.0-relic");
        config.set_version(2, "gateway");
        assert_eq!(config.server_version(), "SSH-2.0-gateway");
        config.set_version(7, "odd");
        assert_eq!(config.server_version(), "SSH-2.0-odd");
    }

    #[tokio::test]
    async fn missing_host_keys_is_an_error() {
        let config = ServerConfig {
            host_key_paths: vec!["/nonexistent/path/key".into()],
            ..Default::default()
        };
        assert!(matches!(
            config.load_host_keys().await,
            Err(ServerError::NoHostKeys)
        ));
    }
}
