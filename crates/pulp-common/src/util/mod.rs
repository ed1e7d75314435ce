pub mod hash;
pub mod tracing;
