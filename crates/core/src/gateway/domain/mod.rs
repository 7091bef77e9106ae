pub mod admission;
pub mod protocol;
