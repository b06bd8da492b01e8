pub mod cache;
pub mod config;
pub mod platform;
pub mod protocol;
pub mod settings;
pub mod tracks;
