pub mod document;
pub mod error;

pub use document::{Document, Namespace, PrimaryKey};
pub use error::{ReplError, Result};
