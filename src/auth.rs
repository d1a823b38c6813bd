//! Pluggable authentication callbacks and the permissions record they
//! produce. The connection handler maps these onto the transport's
//! accept/reject decisions and stashes the permissions in the context.

use std::{collections::HashMap, net::SocketAddr};

use async_trait::async_trait;
use russh::keys::PublicKey;

/// Result of a successful authentication callback. Opaque to the core;
/// handlers inspect it through the context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Permissions {
    pub critical_options: HashMap<String, String>,
    pub extensions: HashMap<String, String>,
}

/// What the client has told us about itself at callback time. The
/// username is empty for pre-auth callbacks such as the banner.
#[derive(Debug, Clone)]
pub struct ConnMeta {
    pub username: String,
    pub remote_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
}

/// Password authentication. Returning `Ok` accepts the attempt with the
/// given permissions; any error rejects it. Rejections are delayed by the
/// server's configured auth rejection time.
#[async_trait]
pub trait PasswordAuth: Send + Sync {
    async fn authenticate(
        &self,
        meta: &ConnMeta,
        password: &[u8],
    ) -> color_eyre::Result<Permissions>;
}

/// Public-key authentication. Called once the transport has verified key
/// ownership; the callback only decides whether the key is authorized.
#[async_trait]
pub trait PublicKeyAuth: Send + Sync {
    async fn authenticate(
        &self,
        meta: &ConnMeta,
        key: &PublicKey,
    ) -> color_eyre::Result<Permissions>;
}

/// One step of a keyboard-interactive exchange.
#[derive(Debug, Clone)]
pub enum KbdInteractiveStep {
    /// Ask the client more questions. Each prompt carries an echo flag.
    Questions {
        name: String,
        instructions: String,
        prompts: Vec<(String, bool)>,
    },
    /// Accept the client with the given permissions.
    Accept(Permissions),
    /// Reject the client.
    Reject,
}

/// Keyboard-interactive authentication as a round-based challenger. Round
/// 0 carries no answers; each later round carries the client's answers to
/// the previous batch of questions. Asking zero questions and accepting
/// on round 0 is valid.
#[async_trait]
pub trait KeyboardInteractiveAuth: Send + Sync {
    async fn challenge(
        &self,
        meta: &ConnMeta,
        round: u32,
        answers: Vec<String>,
    ) -> color_eyre::Result<KbdInteractiveStep>;
}

/// Invoked for every authentication attempt, successful or not.
pub trait AuthLogCallback: Send + Sync {
    fn on_attempt(&self, meta: &ConnMeta, method: &str, error: Option<&str>);
}

/// Banner text sent to the client before authentication.
#[async_trait]
pub trait BannerCallback: Send + Sync {
    async fn banner(&self, meta: &ConnMeta) -> Option<String>;
}

/// The optional callback set a server is configured with.
#[derive(Default, Clone)]
pub struct AuthCallbacks {
    pub password: Option<std::sync::Arc<dyn PasswordAuth>>,
    pub public_key: Option<std::sync::Arc<dyn PublicKeyAuth>>,
    pub keyboard_interactive: Option<std::sync::Arc<dyn KeyboardInteractiveAuth>>,
    pub auth_log: Option<std::sync::Arc<dyn AuthLogCallback>>,
    pub banner: Option<std::sync::Arc<dyn BannerCallback>>,
}

impl AuthCallbacks {
    /// The method names to offer a client, derived from which callbacks
    /// are registered.
    pub(crate) fn method_kinds(&self) -> Vec<russh::MethodKind> {
        let mut methods = Vec::new();
        if self.public_key.is_some() {
            methods.push(russh::MethodKind::PublicKey);
        }
        if self.password.is_some() {
            methods.push(russh::MethodKind::Password);
        }
        if self.keyboard_interactive.is_some() {
            methods.push(russh::MethodKind::KeyboardInteractive);
        }
        methods
    }

    pub(crate) fn log_attempt(&self, meta: &ConnMeta, method: &str, error: Option<&str>) {
        if let Some(ref log) = self.auth_log {
            log.on_attempt(meta, method, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder(std::sync::Mutex<Vec<(String, Option<String>)>>);

    impl AuthLogCallback for Recorder {
        fn on_attempt(&self, _meta: &ConnMeta, method: &str, error: Option<&str>) {
            self.0
                .lock()
                .unwrap()
                .push((method.into(), error.map(String::from)));
        }
    }

    fn meta() -> ConnMeta {
        ConnMeta {
            username: "alice".into(),
            remote_addr: None,
            local_addr: None,
        }
    }

    #[test]
    fn methods_follow_registered_callbacks() {
        let callbacks = AuthCallbacks::default();
        assert!(callbacks.method_kinds().is_empty());

        struct AllowAll;
        #[async_trait]
        impl PasswordAuth for AllowAll {
            async fn authenticate(
                &self,
                _meta: &ConnMeta,
                _password: &[u8],
            ) -> color_eyre::Result<Permissions> {
                Ok(Permissions::default())
            }
        }
        let callbacks = AuthCallbacks {
            password: Some(std::sync::Arc::new(AllowAll)),
            ..Default::default()
        };
        assert_eq!(callbacks.method_kinds(), vec![russh::MethodKind::Password]);
    }

    #[test]
    fn auth_log_sees_every_attempt() {
        let recorder = std::sync::Arc::new(Recorder(std::sync::Mutex::new(Vec::new())));
        let callbacks = AuthCallbacks {
            auth_log: Some(recorder.clone()),
            ..Default::default()
        };
        callbacks.log_attempt(&meta(), "password", Some("bad password"));
        callbacks.log_attempt(&meta(), "publickey", None);
        let seen = recorder.0.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "password");
        assert_eq!(seen[0].1.as_deref(), Some("bad password"));
        assert_eq!(seen[1], ("publickey".into(), None));
    }
}
