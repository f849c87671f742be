pub mod generation;
pub mod pipeline;
