//! Command handlers for the mcpauth CLI.

pub mod login;
pub mod manage;

pub use login::*;
pub use manage::*;
