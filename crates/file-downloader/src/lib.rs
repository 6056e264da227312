mod download;
mod error;

pub use download::*;
pub use error::*;
