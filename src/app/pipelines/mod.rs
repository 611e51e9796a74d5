pub mod image_pipeline;

pub use image_pipeline::ImagePipeline;
