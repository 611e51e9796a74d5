// Adapters layer: concrete implementations for external systems (filesystem, package index, pip).

pub mod installer;
pub mod observer;
pub mod storage;
