pub mod connection;
pub mod entity;
pub mod repository;

pub use connection::establish_connection;

/// Wall clock used for every persisted timestamp (epoch millis).
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
