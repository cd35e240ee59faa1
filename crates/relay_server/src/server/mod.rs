#![forbid(unsafe_code)]

pub mod account_manager;
pub mod health;
pub mod tailer;
