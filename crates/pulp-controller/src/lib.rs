pub mod capabilities;
pub mod crd;
pub mod deps;
pub mod drift;
pub mod error;
pub mod generators;
pub mod naming;
pub mod operator;
pub mod resolve;
pub mod signing;
pub mod status;
pub mod store;

pub use capabilities::Capabilities;
pub use error::{ControllerError, ControllerResult};
pub use operator::run;
