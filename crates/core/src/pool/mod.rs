pub mod domain;
pub mod infrastructure;
pub mod pool_manager;
