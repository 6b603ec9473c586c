use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Query, State};
use axum::{response::IntoResponse, routing::get, Router};

use anyhow::anyhow;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::auth::{identity_for_token, normalize_device_hash};
use crate::gate::GateRequest;
use crate::session::SessionStore;
use crate::shell::render;
use crate::AppState;

// ------------------------------------------------------------
// TYPES
// ------------------------------------------------------------
#[derive(Deserialize, Debug, Default)]
pub struct ConnectParams {
    pub device_hash: Option<String>,
    pub token: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    Authenticate {
        token: String,
        #[serde(default)]
        device_hash: Option<String>,
    },
    Open {
        #[serde(default)]
        course_id: Option<String>,
        #[serde(default = "default_require_subscription")]
        require_subscription: bool,
    },
    SignOut,
    Recheck,
}

fn default_require_subscription() -> bool {
    true
}

impl ClientMsg {
    fn kind(&self) -> &'static str {
        match self {
            ClientMsg::Authenticate { .. } => "authenticate",
            ClientMsg::Open { .. } => "open",
            ClientMsg::SignOut => "sign_out",
            ClientMsg::Recheck => "recheck",
        }
    }
}

// ------------------------------------------------------------
// ROUTER
// ------------------------------------------------------------
pub fn ws_router() -> Router<AppState> {
    Router::new().route("/ws/access", get(ws_handler))
}

async fn ws_handler(
    ws: axum::extract::WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

// ------------------------------------------------------------
// WEBSOCKET HANDLER (SPLIT SOCKET)
// ------------------------------------------------------------
async fn handle_socket(socket: WebSocket, state: AppState, params: ConnectParams) {
    let (mut ws_sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<WsMessage>(32);

    // Dedicated writer task keeps websocket flushing smoothly.
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match timeout(Duration::from_secs(5), ws_sender.send(msg)).await {
                Ok(Ok(_)) => {}
                Ok(Err(_)) => break,
                Err(_) => continue,
            }
        }
    });

    let session = SessionStore::new(state.db.clone());
    session.set_device(params.device_hash.as_deref().and_then(normalize_device_hash));
    let gate = Arc::new(state.gate(session.clone(), GateRequest::default()));
    let _driver = gate.spawn();

    // Push every committed gate state to the client.
    let forwarder = {
        let gate = Arc::clone(&gate);
        let tx = tx.clone();
        let shell = state.shell_config();
        tokio::spawn(async move {
            let mut states = gate.subscribe();
            loop {
                let view = render(&states.borrow_and_update(), &shell);
                if send_json(&tx, serde_json::json!({ "type": "gate", "view": view }))
                    .await
                    .is_err()
                {
                    break;
                }
                if states.changed().await.is_err() {
                    break;
                }
            }
        })
    };

    match params.token {
        Some(token) => authenticate(&state, &session, &tx, &token, None).await,
        None => session.finish_loading(),
    }

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            WsMessage::Text(raw) => {
                let parsed: ClientMsg = match serde_json::from_str(raw.as_str()) {
                    Ok(v) => v,
                    Err(_) => {
                        if send_json(&tx, json_error("Invalid JSON")).await.is_err() {
                            break;
                        }
                        continue;
                    }
                };

                debug!(kind = parsed.kind(), "incoming access message");

                match parsed {
                    ClientMsg::Authenticate { token, device_hash } => {
                        authenticate(&state, &session, &tx, &token, device_hash).await;
                    }
                    ClientMsg::Open {
                        course_id,
                        require_subscription,
                    } => gate.open(course_id, require_subscription),
                    ClientMsg::SignOut => session.sign_out(),
                    ClientMsg::Recheck => gate.recheck(),
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    forwarder.abort();
    drop(tx);
    let _ = writer.await;
    info!("access channel closed");
}

/// Signs the session in, or out when the token does not resolve.
async fn authenticate(
    state: &AppState,
    session: &SessionStore,
    tx: &mpsc::Sender<WsMessage>,
    token: &str,
    device_hash: Option<String>,
) {
    match identity_for_token(state, token).await {
        Ok(Some(identity)) => {
            session.sign_in(identity, device_hash.as_deref().and_then(normalize_device_hash));
        }
        Ok(None) => {
            session.sign_out();
            let _ = send_json(tx, json_error("invalid_token")).await;
        }
        Err(err) => {
            warn!(%err, "identity lookup failed on access channel");
            session.sign_out();
            let _ = send_json(tx, json_error("check_failed")).await;
        }
    }
}

async fn send_json(
    sender: &mpsc::Sender<WsMessage>,
    value: serde_json::Value,
) -> anyhow::Result<()> {
    let msg = WsMessage::Text(value.to_string().into());

    match timeout(Duration::from_secs(2), sender.send(msg)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) => Err(anyhow!("ws channel closed")),
        Err(_) => Ok(()),
    }
}

fn json_error(msg: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "error",
        "message": msg
    })
}
