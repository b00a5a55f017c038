//! BLE sensor viewer core: connect, pair, subscribe and decode.

pub mod domain;
pub mod infrastructure;
pub mod presentation;
