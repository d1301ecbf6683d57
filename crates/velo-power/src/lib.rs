pub mod curve;
pub mod pipeline;
pub mod scheduler;
