pub mod shared_state;
pub mod shared_state_store;
