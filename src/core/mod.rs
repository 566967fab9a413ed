pub mod error;
pub mod types;
pub mod value;

pub use error::{RegistryError, Result, bounded};
pub use types::{Criteria, Record};
pub use value::Value;
