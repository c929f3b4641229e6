pub mod auth;
pub mod config;
pub mod job;
pub mod routes;
pub mod sandbox;
pub mod service;
pub mod web_server;

pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
