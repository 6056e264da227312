#[cfg(feature = "accelerate")]
extern crate accelerate_src;

mod traits;

pub mod llava;

pub use tokenizers;
pub use traits::*;

use tokio::sync::oneshot;

pub type HandlerPayload<TItem, TOutput> = (
    Vec<TItem>,
    oneshot::Sender<anyhow::Result<Vec<anyhow::Result<TOutput>>>>,
);
