pub mod client;
pub mod config;
pub mod decision;
pub mod detection;
pub mod evidence;
pub mod gateway;
pub mod pipeline;
pub mod pool;
pub mod shared;
pub mod state;
