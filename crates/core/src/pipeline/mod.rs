pub mod pipeline_logger;
pub mod worker;
