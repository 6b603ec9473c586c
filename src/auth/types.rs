use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
pub struct EmailRegisterRequest {
    pub email: String,
    pub password: String,
    pub device_hash: Option<String>,
}

#[derive(Deserialize)]
pub struct EmailLoginRequest {
    pub email: String,
    pub password: String,
    pub device_hash: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EmailAuthResponse {
    pub jwt: String,
    pub user_id: String,
    pub email: String,
    pub device_bound: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogoutResponse {
    pub signed_out: bool,
    pub device_released: bool,
}
