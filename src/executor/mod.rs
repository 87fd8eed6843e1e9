//! Database Executor Module
//!
//! Runs statements against individual members and classifies backend errors.

mod mysql;

pub use mysql::{MySqlBackend, MySqlConnector, SqlExceptionFactory, StatementInvoker};
