//! Domain layer: value types, errors, settings and the observer primitive.

pub mod diagnostics;
pub mod error;
pub mod models;
pub mod observers;
pub mod settings;
