//! Utilities module - text helpers shared by the adapters and the router

pub mod text_utils;

pub use text_utils::TextUtils;
