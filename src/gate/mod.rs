//! Access gate: combines the session store and the entitlement resolver into
//! a single decision for one identity/content pair.
//!
//! Device validity is always settled before entitlement is looked at; a
//! rejected device is final regardless of what the subscription says. Every
//! failed check denies.
//!
//! Evaluations may overlap when inputs change while a check is in flight.
//! Each evaluation takes a generation token and only the holder of the newest
//! token may publish its result.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::entitlement::EntitlementResolver;
use crate::session::{SessionSnapshot, SessionStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GateState {
    Initializing,
    Unauthenticated,
    DeviceRejected { check_failed: bool },
    EntitlementRequired { check_failed: bool },
    Granted { is_free: bool },
}

impl GateState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, GateState::Initializing)
    }

    pub fn is_granted(&self) -> bool {
        matches!(self, GateState::Granted { .. })
    }
}

/// What is being opened, and whether it sits behind the paywall.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GateRequest {
    pub content_id: Option<String>,
    pub require_subscription: bool,
}

impl GateRequest {
    pub fn course(course_id: impl Into<String>) -> Self {
        Self {
            content_id: Some(course_id.into()),
            require_subscription: true,
        }
    }
}

pub struct AccessGate {
    session: SessionStore,
    resolver: EntitlementResolver,
    request: watch::Sender<GateRequest>,
    recheck: Notify,
    generation: AtomicU64,
    state: watch::Sender<GateState>,
}

impl AccessGate {
    pub fn new(session: SessionStore, resolver: EntitlementResolver, request: GateRequest) -> Self {
        let (request, _) = watch::channel(request);
        let (state, _) = watch::channel(GateState::Initializing);
        Self {
            session,
            resolver,
            request,
            recheck: Notify::new(),
            generation: AtomicU64::new(0),
            state,
        }
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub fn state(&self) -> GateState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<GateState> {
        self.state.subscribe()
    }

    pub fn request(&self) -> GateRequest {
        self.request.borrow().clone()
    }

    pub fn set_request(&self, request: GateRequest) {
        self.request.send_if_modified(|current| {
            if *current == request {
                return false;
            }
            *current = request;
            true
        });
    }

    pub fn open(&self, content_id: Option<String>, require_subscription: bool) {
        self.set_request(GateRequest {
            content_id,
            require_subscription,
        });
    }

    /// Asks a running driver to evaluate again with unchanged inputs.
    pub fn recheck(&self) {
        self.recheck.notify_one();
    }

    /// Runs one evaluation against the current inputs and returns its outcome.
    /// The outcome is published only if no newer evaluation started meanwhile.
    pub async fn evaluate(&self) -> GateState {
        let token = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.commit(token, GateState::Initializing);

        let snapshot = self.session.snapshot();
        let request = self.request();
        let decided = self.decide(&snapshot, &request).await;

        if self.commit(token, decided.clone()) {
            debug!(token, state = ?decided, "gate state committed");
        } else {
            debug!(token, state = ?decided, "stale gate evaluation dropped");
        }
        decided
    }

    fn commit(&self, token: u64, next: GateState) -> bool {
        self.state.send_if_modified(|current| {
            if self.generation.load(Ordering::SeqCst) != token {
                return false;
            }
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        self.generation.load(Ordering::SeqCst) == token
    }

    /// The transition function. Reads collaborators, never mutates gate state.
    pub async fn decide(&self, snapshot: &SessionSnapshot, request: &GateRequest) -> GateState {
        if snapshot.loading {
            return GateState::Initializing;
        }
        let Some(identity) = snapshot.identity.as_ref() else {
            return GateState::Unauthenticated;
        };

        match self.session.check_device_for(snapshot).await {
            Ok(true) => {}
            Ok(false) => {
                info!(user_id = %identity.id, "device is not the active binding");
                return GateState::DeviceRejected {
                    check_failed: false,
                };
            }
            Err(err) => {
                warn!(user_id = %identity.id, %err, "device check failed; rejecting");
                return GateState::DeviceRejected { check_failed: true };
            }
        }

        let resolved = self
            .resolver
            .resolve(
                identity,
                request.content_id.as_deref(),
                request.require_subscription,
            )
            .await;

        match resolved {
            Ok(e) if e.entitled => GateState::Granted { is_free: e.is_free },
            Ok(_) => GateState::EntitlementRequired {
                check_failed: false,
            },
            Err(err) => {
                warn!(user_id = %identity.id, %err, "entitlement check failed; denying");
                GateState::EntitlementRequired { check_failed: true }
            }
        }
    }

    /// Starts a driver that re-evaluates whenever the session, the request,
    /// or a recheck signal changes. Dropping the handle stops it together
    /// with any evaluation still in flight.
    pub fn spawn(self: &Arc<Self>) -> GateHandle {
        let gate = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut session_rx = gate.session.subscribe();
            let mut request_rx = gate.request.subscribe();
            let mut inflight = JoinSet::new();

            let first = Arc::clone(&gate);
            inflight.spawn(async move {
                first.evaluate().await;
            });

            loop {
                tokio::select! {
                    changed = session_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        session_rx.borrow_and_update();
                    }
                    changed = request_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        request_rx.borrow_and_update();
                    }
                    _ = gate.recheck.notified() => {}
                    Some(_) = inflight.join_next(), if !inflight.is_empty() => continue,
                }

                let next = Arc::clone(&gate);
                inflight.spawn(async move {
                    next.evaluate().await;
                });
            }
        });

        GateHandle { task }
    }
}

/// Owns a running gate driver.
pub struct GateHandle {
    task: JoinHandle<()>,
}

impl Drop for GateHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
