pub mod error;

pub use error::{new_error, with_context};
