//! Domain model module declarations.

pub mod container;
pub mod event;
pub mod session;
pub mod turn;
