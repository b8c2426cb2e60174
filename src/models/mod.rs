//! Domain model module declarations.

pub mod ready;
pub mod state;
