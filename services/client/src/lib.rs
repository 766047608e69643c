pub mod config;
pub mod console;
pub mod microphone;
pub mod speaker;
