mod config;
mod linear;
mod sequential;

mod clip;
mod image_processor;
mod quantized_llama;

mod llava;
pub(super) use config::LLAVA_V1_5_CONFIG;
pub use llava::format_prompt;
pub(super) use llava::QLLaVA;
