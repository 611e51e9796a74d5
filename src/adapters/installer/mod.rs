pub mod index;
pub mod pip;

pub use index::IndexInstaller;
pub use pip::PipInstaller;
