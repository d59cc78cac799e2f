//! Domain model module declarations.

pub mod interaction;
pub mod lead;
pub mod message;
