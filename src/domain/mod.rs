// Domain layer: build model and ports. Concrete storage and installers live in adapters.

pub mod model;
pub mod ports;
