//! Command implementations

pub mod history;
pub mod status;
pub mod unlock;
