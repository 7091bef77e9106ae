pub mod action;
pub mod decision_engine;
