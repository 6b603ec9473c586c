pub mod handler;

pub use handler::ws_router;
