pub mod config;
pub mod security;
