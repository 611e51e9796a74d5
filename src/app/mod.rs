pub mod agent;
pub mod pipelines;
