mod archive;
mod batch;
mod config;
mod decode;
mod engine;
mod error;

pub use archive::*;
pub use batch::*;
pub use config::*;
pub use decode::*;
pub use engine::*;
pub use error::*;

#[cfg(test)]
mod testing;
