pub mod course;
pub mod preferences;
pub mod subscription;
pub mod user;
pub mod user_device;
