use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::{fs, path::Path};
use tracing::{error, warn};

use crate::AppState;

static INTERNAL_AUTH: OnceCell<Option<InternalAuthConfig>> = OnceCell::new();

#[derive(Debug, Deserialize)]
struct InternalAuthConfig {
    username: String,
    password: String,
}

pub async fn require_internal_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(config) = auth_config(&state.config.internal_auth_file) else {
        error!(
            path = %state.config.internal_auth_file,
            "internal operator credentials are missing"
        );
        return Ok(internal_error_response());
    };

    let Some((username, password)) = basic_credentials(&req) else {
        return Ok(unauthorized_response());
    };

    if username != config.username || password != config.password {
        warn!(username = %username, "rejected internal operator credentials");
        return Ok(unauthorized_response());
    }

    Ok(next.run(req).await)
}

fn basic_credentials(req: &Request<Body>) -> Option<(String, String)> {
    let header_str = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = header_str.strip_prefix("Basic ")?;
    let decoded = String::from_utf8(BASE64.decode(encoded).ok()?).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

fn auth_config(path: &str) -> Option<&'static InternalAuthConfig> {
    INTERNAL_AUTH
        .get_or_init(|| load_auth_config(path).ok())
        .as_ref()
}

fn load_auth_config(path: &str) -> Result<InternalAuthConfig, std::io::Error> {
    if !Path::new(path).exists() {
        warn!(path, "internal operator auth file not found; internal routes disabled");
        return Err(std::io::Error::from(std::io::ErrorKind::NotFound));
    }

    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|err| {
        error!(?err, "failed to parse internal operator auth file");
        std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid auth file")
    })
}

fn unauthorized_response() -> Response {
    let mut res = Response::new(Body::from("unauthorized"));
    *res.status_mut() = StatusCode::UNAUTHORIZED;
    res.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"Internal\""),
    );
    res
}

fn internal_error_response() -> Response {
    let mut res = Response::new(Body::from("internal auth not configured"));
    *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    res
}
