pub mod config;
pub mod data;
pub mod lookup;
pub mod projection;
pub mod render;
pub mod scale;
pub mod server;
pub mod state;
pub mod types;
