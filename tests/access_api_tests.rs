use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use medquest_gate::{
    build_router,
    config::AppConfig,
    db::DBLayer,
    model::{course::Course, subscription::Subscription},
    AppState,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const SECRET: &str = "integration-secret";

type AccessSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    base: String,
    ws_base: String,
    db: Arc<DBLayer>,
    client: reqwest::Client,
    _dir: tempfile::TempDir,
}

/// Operator credentials are cached per process, so every test shares one file.
fn internal_auth_file() -> String {
    static PATH: OnceLock<String> = OnceLock::new();
    PATH.get_or_init(|| {
        let path = std::env::temp_dir().join(format!(
            "medquest_gate_internal_auth_{}.json",
            std::process::id()
        ));
        std::fs::write(&path, r#"{"username":"ops","password":"ops-pass"}"#).unwrap();
        path.to_string_lossy().into_owned()
    })
    .clone()
}

/// Spin up the HTTP server on an OS-assigned port with a fresh database.
async fn spawn_test_server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(DBLayer::new(dir.path()).unwrap());

    let mut config = AppConfig::with_secret(SECRET);
    config.internal_auth_file = internal_auth_file();

    let app = build_router(AppState::new(db.clone(), config, None));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    for (id, is_free) in [("c1", true), ("c2", false)] {
        db.save_course(&Course {
            id: id.into(),
            title: format!("Course {id}"),
            description: None,
            is_free,
            content: Some(json!({ "questions": [id] })),
            created_ts: 0,
        })
        .await
        .unwrap();
    }

    TestServer {
        base: format!("http://127.0.0.1:{}", port),
        ws_base: format!("ws://127.0.0.1:{}/ws/access", port),
        db,
        client: reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap(),
        _dir: dir,
    }
}

impl TestServer {
    async fn register(&self, email: &str, device: &str) -> (String, String) {
        let resp = self
            .client
            .post(format!("{}/api/auth/register", self.base))
            .json(&json!({ "email": email, "password": "password123", "device_hash": device }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["device_bound"], true);
        (
            body["jwt"].as_str().unwrap().to_string(),
            body["user_id"].as_str().unwrap().to_string(),
        )
    }

    async fn open_course(&self, course: &str, token: Option<&str>, device: &str) -> reqwest::Response {
        let mut req = self
            .client
            .get(format!("{}/api/courses/{}", self.base, course))
            .header("x-device-hash", device);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        req.send().await.unwrap()
    }

    async fn connect(&self, query: &str) -> AccessSocket {
        let (socket, _) = connect_async(format!("{}?{}", self.ws_base, query))
            .await
            .unwrap();
        socket
    }
}

async fn send(socket: &mut AccessSocket, msg: Value) {
    socket.send(Message::Text(msg.to_string().into())).await.unwrap();
}

/// Reads gate views until one has the wanted status. Intermediate views such
/// as `loading` are skipped; errors from the server fail the test.
async fn wait_for_view(socket: &mut AccessSocket, status: &str) -> Value {
    let wait = async {
        loop {
            let Message::Text(text) = socket.next().await.unwrap().unwrap() else {
                continue;
            };
            let frame: Value = serde_json::from_str(text.as_str()).unwrap();
            match frame["type"].as_str() {
                Some("gate") if frame["view"]["status"] == status => return frame["view"].clone(),
                Some("gate") => continue,
                _ => panic!("unexpected frame {frame}"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .unwrap_or_else(|_| panic!("no {status} view within 5s"))
}

#[tokio::test]
async fn free_course_is_granted_without_subscription() {
    let server = spawn_test_server().await;
    let (jwt, _) = server.register("free@example.com", "dev-a").await;

    let resp = server.open_course("c1", Some(&jwt), "dev-a").await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["id"], "c1");
    assert_eq!(body["content"]["questions"][0], "c1");
}

#[tokio::test]
async fn paid_course_requires_current_subscription() {
    let server = spawn_test_server().await;
    let (jwt, user_id) = server.register("paid@example.com", "dev-a").await;

    let resp = server.open_course("c2", Some(&jwt), "dev-a").await;
    assert_eq!(resp.status(), 402);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "subscription_required");
    assert_eq!(body["action"]["href"], "/pricing");

    let now = chrono::Utc::now().timestamp();
    server
        .db
        .save_subscription(&Subscription::new(&user_id, now - 40 * 86_400, 30 * 86_400))
        .await
        .unwrap();
    let resp = server.open_course("c2", Some(&jwt), "dev-a").await;
    assert_eq!(resp.status(), 402);

    server
        .db
        .save_subscription(&Subscription::new(&user_id, now, 30 * 86_400))
        .await
        .unwrap();
    let resp = server.open_course("c2", Some(&jwt), "dev-a").await;
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn signing_in_elsewhere_rejects_previous_device() {
    let server = spawn_test_server().await;
    let (jwt, _) = server.register("moved@example.com", "dev-a").await;

    let resp = server
        .client
        .post(format!("{}/api/auth/login", server.base))
        .json(&json!({ "email": "moved@example.com", "password": "password123", "device_hash": "dev-b" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = server.open_course("c1", Some(&jwt), "dev-a").await;
    assert_eq!(resp.status(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "device_rejected");

    let resp = server.open_course("c1", Some(&jwt), "dev-b").await;
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn anonymous_request_is_redirected_to_sign_in() {
    let server = spawn_test_server().await;

    let resp = server.open_course("c1", None, "dev-a").await;
    assert_eq!(resp.status(), 303);
    assert_eq!(resp.headers().get("location").unwrap(), "/login");

    let resp = server.open_course("c1", Some("not-a-token"), "dev-a").await;
    assert_eq!(resp.status(), 303);
}

#[tokio::test]
async fn session_reports_device_validity() {
    let server = spawn_test_server().await;
    let (jwt, user_id) = server.register("session@example.com", "dev-a").await;

    let session = |device: &'static str| {
        server
            .client
            .get(format!("{}/api/session", server.base))
            .bearer_auth(&jwt)
            .header("x-device-hash", device)
            .send()
    };

    let body: Value = session("dev-a").await.unwrap().json().await.unwrap();
    assert_eq!(body["identity"]["id"], user_id.as_str());
    assert_eq!(body["device_valid"], true);

    let body: Value = session("dev-z").await.unwrap().json().await.unwrap();
    assert_eq!(body["device_valid"], false);
}

#[tokio::test]
async fn logout_releases_device() {
    let server = spawn_test_server().await;
    let (jwt, _) = server.register("bye@example.com", "dev-a").await;

    let resp = server
        .client
        .post(format!("{}/api/auth/logout", server.base))
        .bearer_auth(&jwt)
        .header("x-device-hash", "dev-a")
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["device_released"], true);

    let resp = server.open_course("c1", Some(&jwt), "dev-a").await;
    assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn course_catalog_is_public_and_hides_content() {
    let server = spawn_test_server().await;
    let body: Value = server
        .client
        .get(format!("{}/api/courses", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let courses = body["courses"].as_array().unwrap();
    assert_eq!(courses.len(), 2);
    assert!(courses.iter().all(|c| c.get("content").is_none()));
}

#[tokio::test]
async fn preferences_default_then_persist() {
    let server = spawn_test_server().await;
    let (jwt, _) = server.register("prefs@example.com", "dev-a").await;
    let url = format!("{}/api/preferences", server.base);

    let body: Value = server
        .client
        .get(&url)
        .bearer_auth(&jwt)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["preferences"], json!({ "language": "en", "theme": "light" }));

    server
        .client
        .put(&url)
        .bearer_auth(&jwt)
        .json(&json!({ "language": "ar", "theme": "dark" }))
        .send()
        .await
        .unwrap();
    let body: Value = server
        .client
        .get(&url)
        .bearer_auth(&jwt)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["preferences"]["theme"], "dark");

    let resp = server.client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn duplicate_registration_is_rejected() {
    let server = spawn_test_server().await;
    server.register("dup@example.com", "dev-a").await;

    let resp = server
        .client
        .post(format!("{}/api/auth/register", server.base))
        .json(&json!({ "email": "DUP@example.com", "password": "password123" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn internal_routes_require_operator_credentials() {
    let server = spawn_test_server().await;
    let (jwt, user_id) = server.register("ops@example.com", "dev-a").await;
    let url = format!("{}/internal/users/{}/subscriptions", server.base, user_id);

    let resp = server.client.post(&url).json(&json!({})).send().await.unwrap();
    assert_eq!(resp.status(), 401);

    let resp = server
        .client
        .post(&url)
        .basic_auth("ops", Some("ops-pass"))
        .json(&json!({ "days": 7 }))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["granted"], true);

    let resp = server.open_course("c2", Some(&jwt), "dev-a").await;
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn payment_routes_report_unconfigured() {
    let server = spawn_test_server().await;
    let resp = server
        .client
        .get(format!("{}/payment/config", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
}

#[tokio::test]
async fn access_channel_follows_session_and_course() {
    let server = spawn_test_server().await;
    let (jwt, _) = server.register("live@example.com", "dev-a").await;

    let mut socket = server
        .connect(&format!("token={jwt}&device_hash=dev-a"))
        .await;
    let view = wait_for_view(&mut socket, "granted").await;
    assert_eq!(view["is_free"], false);

    send(&mut socket, json!({ "type": "open", "course_id": "c2" })).await;
    let view = wait_for_view(&mut socket, "subscription_required").await;
    assert_eq!(view["action"]["href"], "/pricing");

    send(&mut socket, json!({ "type": "open", "course_id": "c1" })).await;
    let view = wait_for_view(&mut socket, "granted").await;
    assert_eq!(view["is_free"], true);

    send(&mut socket, json!({ "type": "sign_out" })).await;
    let view = wait_for_view(&mut socket, "redirect").await;
    assert_eq!(view["location"], "/login");

    send(
        &mut socket,
        json!({ "type": "authenticate", "token": jwt, "device_hash": " dev-a " }),
    )
    .await;
    wait_for_view(&mut socket, "granted").await;
}

#[tokio::test]
async fn access_channel_authenticates_by_message_and_rechecks() {
    let server = spawn_test_server().await;
    let (jwt, user_id) = server.register("recheck@example.com", "dev-a").await;

    let mut socket = server.connect("device_hash=dev-a%20").await;
    wait_for_view(&mut socket, "redirect").await;

    send(&mut socket, json!({ "type": "authenticate", "token": jwt })).await;
    wait_for_view(&mut socket, "granted").await;

    send(&mut socket, json!({ "type": "open", "course_id": "c2" })).await;
    wait_for_view(&mut socket, "subscription_required").await;

    let now = chrono::Utc::now().timestamp();
    server
        .db
        .save_subscription(&Subscription::new(&user_id, now, 30 * 86_400))
        .await
        .unwrap();
    send(&mut socket, json!({ "type": "recheck" })).await;
    let view = wait_for_view(&mut socket, "granted").await;
    assert_eq!(view["is_free"], false);
}

#[tokio::test]
async fn access_channel_rejects_superseded_device() {
    let server = spawn_test_server().await;
    let (jwt, _) = server.register("swap@example.com", "dev-a").await;

    let mut socket = server
        .connect(&format!("token={jwt}&device_hash=dev-a"))
        .await;
    wait_for_view(&mut socket, "granted").await;

    let resp = server
        .client
        .post(format!("{}/api/auth/login", server.base))
        .json(&json!({ "email": "swap@example.com", "password": "password123", "device_hash": "dev-b" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    send(&mut socket, json!({ "type": "recheck" })).await;
    let view = wait_for_view(&mut socket, "device_rejected").await;
    assert_eq!(view["action"]["href"], "/login");
}

#[tokio::test]
async fn oversized_grant_is_refused() {
    let server = spawn_test_server().await;
    let (jwt, user_id) = server.register("huge@example.com", "dev-a").await;
    let url = format!("{}/internal/users/{}/subscriptions", server.base, user_id);

    let body: Value = server
        .client
        .post(&url)
        .basic_auth("ops", Some("ops-pass"))
        .json(&json!({ "days": i64::MAX }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["granted"], false);
    assert_eq!(body["error"], "days_out_of_range");

    assert!(server.db.list_subscriptions_for_user(&user_id).await.unwrap().is_empty());
    let resp = server.open_course("c2", Some(&jwt), "dev-a").await;
    assert_eq!(resp.status(), 402);
}
