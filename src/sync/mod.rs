//! Incremental conversation sync into an append-only Markdown archive.

pub mod audit;
pub mod config;
pub mod cursor;
pub mod engagement;
pub mod engine;
pub mod fetch;
pub mod governor;
pub mod manifest;
pub mod markdown;
pub mod members;
pub mod merge;
pub mod model;
pub mod paths;
pub mod profile;
pub mod query;
pub mod util;
pub mod warn;
