//! Incremental sync of Discord and Telegram conversations into an
//! append-only Markdown archive, with member snapshots and engagement
//! reporting on top.

pub mod commands;
pub mod error;
pub mod platform;
pub mod sync;
