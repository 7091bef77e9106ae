pub mod in_memory_state_store;
pub mod redis_state_store;
