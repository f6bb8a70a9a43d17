//! Order orchestration service: hosts the order saga and the reliable
//! messaging workers it rides on (outbox relay, inbox consumer, recovery
//! scanner, inbox compaction).

pub mod config;
pub mod consumers;
pub mod handlers;
pub mod saga;
pub mod workers;
