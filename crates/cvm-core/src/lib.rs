pub mod error;
pub mod value;

pub use error::VmError;
pub use value::*;
