//! Per-connection context: the data carrier and cancellation root shared
//! by every handler running on one SSH connection.

use std::{
    any::Any,
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, Weak},
};

use russh::server::Handle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::{auth::Permissions, server::SshServer, user::User};

/// The standard slots, populated progressively while the handshake runs.
/// Readers see either the previous value or the new one, never a torn
/// composite, because every slot swap happens under the lock.
#[derive(Default)]
struct Slots {
    user: Option<Arc<User>>,
    permissions: Option<Arc<Permissions>>,
    client_version: Option<String>,
    server_version: Option<String>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    handle: Option<Handle>,
}

/// Scope: one client connection, from before authentication finishes
/// until the last handler task observes cancellation. Auth callbacks may
/// attach data before the acceptor fills in the standard slots.
pub struct ConnectionContext {
    token: CancellationToken,
    server: Weak<SshServer>,
    slots: Mutex<Slots>,
    values: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl ConnectionContext {
    pub(crate) fn new(server: Weak<SshServer>, token: CancellationToken) -> Self {
        ConnectionContext {
            token,
            server,
            slots: Mutex::new(Slots::default()),
            values: Mutex::new(HashMap::new()),
        }
    }

    /// Store an arbitrary value under a string key. Typed accessors are
    /// the primary surface; this is the escape hatch for handler-private
    /// state.
    pub fn set(&self, key: impl Into<String>, value: impl Any + Send + Sync) {
        self.values
            .lock()
            .unwrap()
            .insert(key.into(), Arc::new(value));
    }

    /// Fetch a value stored with [`set`](Self::set), downcast to its
    /// concrete type. Returns `None` for a missing key or a type
    /// mismatch.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.values
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .and_then(|value| value.downcast().ok())
    }

    /// Resolves once the context has been cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel this connection's context. Monotone: once fired it stays
    /// fired, and every derived child token observes it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Derive a token scoped below this connection, e.g. for the lifetime
    /// of a single spawned process inside a session channel.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn server(&self) -> Option<Arc<SshServer>> {
        self.server.upgrade()
    }

    pub fn user(&self) -> Option<Arc<User>> {
        self.slots.lock().unwrap().user.clone()
    }

    pub fn set_user(&self, user: User) {
        self.slots.lock().unwrap().user = Some(Arc::new(user));
    }

    pub fn permissions(&self) -> Option<Arc<Permissions>> {
        self.slots.lock().unwrap().permissions.clone()
    }

    pub fn set_permissions(&self, permissions: Permissions) {
        self.slots.lock().unwrap().permissions = Some(Arc::new(permissions));
    }

    pub fn client_version(&self) -> Option<String> {
        self.slots.lock().unwrap().client_version.clone()
    }

    pub fn set_client_version(&self, version: impl Into<String>) {
        self.slots.lock().unwrap().client_version = Some(version.into());
    }

    pub fn server_version(&self) -> Option<String> {
        self.slots.lock().unwrap().server_version.clone()
    }

    pub fn set_server_version(&self, version: impl Into<String>) {
        self.slots.lock().unwrap().server_version = Some(version.into());
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.slots.lock().unwrap().local_addr
    }

    pub fn set_local_addr(&self, addr: SocketAddr) {
        self.slots.lock().unwrap().local_addr = Some(addr);
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.slots.lock().unwrap().remote_addr
    }

    pub fn set_remote_addr(&self, addr: SocketAddr) {
        self.slots.lock().unwrap().remote_addr = Some(addr);
    }

    /// Handle to the underlying SSH connection, for opening back-channels
    /// and replying to channel requests. Present once the transport
    /// event loop is running.
    pub fn handle(&self) -> Option<Handle> {
        self.slots.lock().unwrap().handle.clone()
    }

    pub(crate) fn set_handle(&self, handle: Handle) {
        self.slots.lock().unwrap().handle = Some(handle);
    }
}
