//! Constants for categorizing log targets, so that downstream users can
//! control the verbosity of each subsystem separately (e.g.
//! `RUST_LOG=is::db=trace,is=info`).

pub const LOG_INSTANTSEND: &str = "is";
pub const LOG_DB: &str = "is::db";
pub const LOG_SIGNING: &str = "is::signing";
pub const LOG_NET: &str = "is::net";
pub const LOG_TASK: &str = "is::task";
