use super::{
    clip::{Activation, ClipVisionConfig},
    llava::LLaVAConfig,
};

/// llava-v1.5-7b, as converted by llama.cpp into `ggml-model-q4_k.gguf`
/// and `mmproj-model-f16.gguf`.
pub const LLAVA_V1_5_CONFIG: LLaVAConfig = LLaVAConfig {
    eos_token_id: 2, // </s>
    bos_token_id: 1, // <s>
    // same placeholder as IMAGE_TOKEN_INDEX in llava, never reaches the tokenizer
    image_token_index: -200,
    text_hidden_size: 4096, // llama.embedding_length
    max_length: 4096,       // llama.context_length
    mm_projector_depth: 2,  // mlp2x_gelu
    // from metadata of mmproj-model-f16.gguf
    clip_vision_config: ClipVisionConfig {
        activation: Activation::QuickGelu,
        hidden_size: 1024,       // clip.vision.embedding_length
        intermediate_size: 4096, // clip.vision.feed_forward_length
        num_hidden_layers: 23,   // clip.vision.block_count
        num_attention_heads: 16, // clip.vision.attention.head_count
        projection_dim: 768,     // clip.vision.projection_dim
        num_channels: 3,
        image_size: 336,
        patch_size: 14,
        layer_norm_eps: 1e-5, // clip.vision.attention.layer_norm_epsilon
    },
};
