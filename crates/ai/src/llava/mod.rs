mod quantized_llava;
pub use quantized_llava::format_prompt;
use quantized_llava::{QLLaVA, LLAVA_V1_5_CONFIG};

use crate::traits::{ImageCaptionInput, ImageCaptionOutput, Model};
use candle_core::{DType, Device};
use candle_transformers::generation::LogitsProcessor;
use std::path::Path;
use strum_macros::{AsRefStr, Display, EnumString};

/// Where the model weights live and run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Cpu,
    Metal,
    Cuda,
}

impl DeviceKind {
    pub fn device(&self) -> anyhow::Result<Device> {
        let device = match self {
            DeviceKind::Cpu => Device::Cpu,
            DeviceKind::Metal => Device::new_metal(0)?,
            DeviceKind::Cuda => Device::new_cuda(0)?,
        };
        Ok(device)
    }
}

/// Weights are expected to be stored 4-bit quantized, the rest of the
/// network computes in `compute_dtype`.
#[derive(Debug, Clone)]
pub struct QuantizationConfig {
    pub load_in_4bit: bool,
    pub compute_dtype: DType,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            load_in_4bit: true,
            compute_dtype: DType::F16,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub seed: u64,
    /// `None` means greedy decoding
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            seed: 299792458,
            temperature: None,
            top_p: None,
        }
    }
}

/// llava-v1.5-7b with q4_k llama weights, captioning one image per call.
pub struct LLaVA {
    qllava: QLLaVA,
    generation_config: GenerationConfig,
}

impl Model for LLaVA {
    type Item = ImageCaptionInput;
    type Output = ImageCaptionOutput;

    fn batch_size_limit(&self) -> usize {
        1
    }

    async fn process(
        &mut self,
        items: Vec<Self::Item>,
    ) -> anyhow::Result<Vec<anyhow::Result<Self::Output>>> {
        if items.len() > self.batch_size_limit() {
            anyhow::bail!("too many items");
        }

        let mut results = vec![];
        for item in items {
            results.push(self.caption(item));
        }

        Ok(results)
    }
}

impl LLaVA {
    pub async fn new(
        device: DeviceKind,
        gguf_model_path: impl AsRef<Path>,
        mmproj_gguf_model_path: impl AsRef<Path>,
        tokenizer_path: impl AsRef<Path>,
        quantization: QuantizationConfig,
    ) -> anyhow::Result<Self> {
        let device = device.device()?;
        // half precision kernels are not available on cpu
        let compute_dtype = if device.is_cpu() {
            DType::F32
        } else {
            quantization.compute_dtype
        };
        tracing::info!(
            "loading llava on {:?}, compute dtype {:?}",
            device,
            compute_dtype
        );

        let qllava = QLLaVA::load(
            LLAVA_V1_5_CONFIG,
            &device,
            compute_dtype,
            quantization.load_in_4bit,
            gguf_model_path,
            mmproj_gguf_model_path,
            tokenizer_path,
        )?;

        Ok(Self {
            qllava,
            generation_config: GenerationConfig::default(),
        })
    }

    pub fn with_generation_config(mut self, generation_config: GenerationConfig) -> Self {
        self.generation_config = generation_config;
        self
    }

    fn caption(&mut self, item: ImageCaptionInput) -> anyhow::Result<String> {
        let start = std::time::Instant::now();
        // seeded per image
        let mut logits_processor = LogitsProcessor::new(
            self.generation_config.seed,
            self.generation_config.temperature,
            self.generation_config.top_p,
        );
        let text = self.qllava.generate(
            &item.image,
            &item.prompt,
            item.max_new_tokens,
            &mut logits_processor,
        )?;
        tracing::debug!("caption generated in {:?}", start.elapsed());
        Ok(text)
    }
}
