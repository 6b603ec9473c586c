//! Session store: who is signed in on this browsing context, and whether the
//! context is the device that identity is bound to.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::warn;

use crate::error::{CheckError, CheckResult};
use crate::model::user::Identity;

/// Answers whether a device fingerprint is the active binding of a user.
#[async_trait]
pub trait DeviceSessions: Send + Sync {
    async fn is_device_valid(&self, user_id: &str, device_hash: &str) -> CheckResult<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub identity: Option<Identity>,
    pub device_hash: Option<String>,
    pub loading: bool,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            identity: None,
            device_hash: None,
            loading: true,
        }
    }
}

#[derive(Clone)]
pub struct SessionStore {
    devices: Arc<dyn DeviceSessions>,
    tx: Arc<watch::Sender<SessionSnapshot>>,
}

impl SessionStore {
    pub fn new(devices: Arc<dyn DeviceSessions>) -> Self {
        let (tx, _) = watch::channel(SessionSnapshot::default());
        Self {
            devices,
            tx: Arc::new(tx),
        }
    }

    /// A store whose loading already finished with the given identity.
    pub fn resolved(
        devices: Arc<dyn DeviceSessions>,
        identity: Option<Identity>,
        device_hash: Option<String>,
    ) -> Self {
        let store = Self::new(devices);
        store.tx.send_replace(SessionSnapshot {
            identity,
            device_hash,
            loading: false,
        });
        store
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.tx.subscribe()
    }

    pub fn identity(&self) -> CheckResult<Identity> {
        self.tx
            .borrow()
            .identity
            .clone()
            .ok_or(CheckError::Unauthenticated)
    }

    pub fn sign_in(&self, identity: Identity, device_hash: Option<String>) {
        self.tx.send_modify(|s| {
            s.identity = Some(identity);
            if device_hash.is_some() {
                s.device_hash = device_hash;
            }
            s.loading = false;
        });
    }

    pub fn sign_out(&self) {
        self.tx.send_modify(|s| {
            s.identity = None;
            s.loading = false;
        });
    }

    pub fn finish_loading(&self) {
        self.tx.send_if_modified(|s| std::mem::replace(&mut s.loading, false));
    }

    pub fn set_device(&self, device_hash: Option<String>) {
        self.tx.send_if_modified(|s| {
            if s.device_hash == device_hash {
                return false;
            }
            s.device_hash = device_hash;
            true
        });
    }

    /// Checks the current snapshot against the device binding store.
    pub async fn check_device(&self) -> CheckResult<bool> {
        let snapshot = self.snapshot();
        self.check_device_for(&snapshot).await
    }

    pub(crate) async fn check_device_for(&self, snapshot: &SessionSnapshot) -> CheckResult<bool> {
        let (Some(identity), Some(device_hash)) = (&snapshot.identity, &snapshot.device_hash)
        else {
            return Ok(false);
        };
        if device_hash.is_empty() {
            return Ok(false);
        }
        self.devices.is_device_valid(&identity.id, device_hash).await
    }

    /// Same as [`check_device`](Self::check_device), but a failed lookup counts as invalid.
    pub async fn check_device_session(&self) -> bool {
        match self.check_device().await {
            Ok(valid) => valid,
            Err(err) => {
                warn!(%err, "device session check failed; treating device as invalid");
                false
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{identity, FakeDevices};
    use super::*;

    #[tokio::test]
    async fn starts_loading_without_identity() {
        let store = SessionStore::new(Arc::new(FakeDevices::default()));
        let snap = store.snapshot();
        assert!(snap.loading);
        assert!(snap.identity.is_none());
        assert_eq!(store.identity(), Err(CheckError::Unauthenticated));
    }

    #[tokio::test]
    async fn bound_device_is_valid() {
        let store = SessionStore::new(Arc::new(FakeDevices::with_binding("u1", "dev-a")));
        store.sign_in(identity("u1"), Some("dev-a".into()));
        assert!(store.check_device_session().await);

        store.set_device(Some("dev-b".into()));
        assert!(!store.check_device_session().await);
    }

    #[tokio::test]
    async fn missing_device_hash_is_invalid_without_lookup() {
        let devices = Arc::new(FakeDevices::with_binding("u1", "dev-a"));
        let store = SessionStore::resolved(devices.clone(), Some(identity("u1")), None);
        assert_eq!(store.check_device().await, Ok(false));
        assert_eq!(*devices.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn transport_error_fails_closed() {
        let devices = Arc::new(FakeDevices::with_binding("u1", "dev-a"));
        *devices.fail.lock().unwrap() = true;
        let store = SessionStore::resolved(devices, Some(identity("u1")), Some("dev-a".into()));
        assert!(store.check_device().await.is_err());
        assert!(!store.check_device_session().await);
    }

    #[tokio::test]
    async fn subscribers_see_sign_out() {
        let store = SessionStore::new(Arc::new(FakeDevices::default()));
        let mut rx = store.subscribe();
        store.sign_in(identity("u1"), None);
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().identity.is_some());

        store.sign_out();
        rx.changed().await.unwrap();
        let snap = rx.borrow_and_update().clone();
        assert!(snap.identity.is_none());
        assert!(!snap.loading);
    }

    #[tokio::test]
    async fn finish_loading_notifies_once() {
        let store = SessionStore::new(Arc::new(FakeDevices::default()));
        let mut rx = store.subscribe();
        store.finish_loading();
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        store.finish_loading();
        assert!(!rx.has_changed().unwrap());
    }
}
