use super::{
    clip::{ClipVisionConfig, ClipVisionTransformer},
    image_processor::ImageProcessor,
    linear::QLinear,
    quantized_llama,
    sequential::{seq, QSequential, QSequentialLayer},
};
use candle_core::{quantized::gguf_file, DType, Device, IndexOp, Module, Tensor};
use candle_transformers::{generation::LogitsProcessor, quantized_var_builder};
use image::DynamicImage;
use std::{ops::Range, path::Path};
use tokenizers::Tokenizer;

pub const IMAGE_PLACEHOLDER: &str = "<image>";

#[derive(Debug, Clone)]
pub struct LLaVAConfig {
    pub eos_token_id: u32,
    pub bos_token_id: u32,
    pub image_token_index: i64,
    pub text_hidden_size: usize,
    pub max_length: usize,
    pub mm_projector_depth: usize,
    pub clip_vision_config: ClipVisionConfig,
}

#[derive(Debug)]
struct MMProjector {
    pub modules: QSequential,
}

impl MMProjector {
    pub fn new(
        vb: quantized_var_builder::VarBuilder,
        config: &LLaVAConfig,
        dtype: DType,
    ) -> candle_core::Result<Self> {
        let text_hidden_size: usize = config.text_hidden_size; // 4096
        let mm_hidden_size: usize = config.clip_vision_config.hidden_size; // 1024
        let modules = {
            let layer = QLinear::load(mm_hidden_size, text_hidden_size, vb.pp("0"), dtype)?;
            let mut modules = seq().add(QSequentialLayer::QLinear(layer));
            for i in 1..config.mm_projector_depth {
                let layer = QLinear::load(
                    text_hidden_size,
                    text_hidden_size,
                    vb.pp(format!("{}", i * 2)),
                    dtype,
                )?;
                modules = modules
                    .add(QSequentialLayer::Activation(candle_nn::Activation::Gelu))
                    .add(QSequentialLayer::QLinear(layer));
            }
            modules
        };
        Ok(Self { modules })
    }

    #[tracing::instrument(level = "debug", name = "MMProjector", skip_all)]
    pub fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        self.modules.forward(x)
    }
}

#[derive(Debug)]
struct ClipVisionTower {
    model: ClipVisionTransformer,
}

impl ClipVisionTower {
    pub fn new(
        vb: quantized_var_builder::VarBuilder,
        clip_vision_config: &ClipVisionConfig,
        dtype: DType,
    ) -> candle_core::Result<Self> {
        let model = ClipVisionTransformer::new(vb, clip_vision_config, dtype)?;
        Ok(Self { model })
    }

    #[tracing::instrument(level = "debug", name = "ClipVisionTower", skip_all)]
    pub fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        // llava takes the second to last clip layer as image feature,
        // the gguf already dropped the last layer so the output is used directly
        self.model.patch_features(x)
    }
}

pub struct QLLaVA {
    llama: quantized_llama::ModelWeights,
    clip_vision_tower: ClipVisionTower,
    mm_projector: MMProjector,
    image_processor: ImageProcessor,
    tokenizer: Tokenizer,
    config: LLaVAConfig,
    device: Device,
    compute_dtype: DType,
}

impl QLLaVA {
    pub fn load(
        config: LLaVAConfig,
        device: &Device,
        compute_dtype: DType,
        load_in_4bit: bool,
        gguf_model_path: impl AsRef<Path>,
        mmproj_gguf_model_path: impl AsRef<Path>,
        tokenizer_path: impl AsRef<Path>,
    ) -> anyhow::Result<Self> {
        let llama = {
            let gguf_model_path = gguf_model_path.as_ref();
            let mut file = std::fs::File::open(gguf_model_path)?;
            let gguf_content =
                gguf_file::Content::read(&mut file).map_err(|e| e.with_path(gguf_model_path))?;

            let weight_dtype = quantized_llama::ModelWeights::weight_dtype(&gguf_content);
            tracing::info!("llama weights stored as {:?}", weight_dtype);
            if load_in_4bit && !matches!(weight_dtype, Some(dtype) if is_4bit(dtype)) {
                tracing::warn!(
                    "4-bit weights requested but {} is stored as {:?}",
                    gguf_model_path.display(),
                    weight_dtype
                );
            }

            quantized_llama::ModelWeights::from_gguf(gguf_content, &mut file, device)?
        };

        if llama.hidden_size() != config.text_hidden_size {
            anyhow::bail!(
                "llama hidden size {} does not match projector output {}",
                llama.hidden_size(),
                config.text_hidden_size
            );
        }

        let (clip_vision_tower, mm_projector) = {
            let vb = quantized_var_builder::VarBuilder::from_gguf(mmproj_gguf_model_path, device)?;
            let mm_projector = MMProjector::new(vb.pp("mm"), &config, compute_dtype)?;
            let clip_vision_tower =
                ClipVisionTower::new(vb.pp("v"), &config.clip_vision_config, compute_dtype)?;
            (clip_vision_tower, mm_projector)
        };

        let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(anyhow::Error::msg)?;

        Ok(Self {
            llama,
            clip_vision_tower,
            mm_projector,
            image_processor: ImageProcessor::default(),
            tokenizer,
            config,
            device: device.clone(),
            compute_dtype,
        })
    }

    /// x shape:                        Tensor[dims 1, 3, 336, 336]
    /// clip_vision_tower result shape: Tensor[dims 1, 576, 1024]
    /// mm_projector result shape:      Tensor[dims 1, 576, 4096; f32]
    fn encode_images(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let image_features = self.clip_vision_tower.forward(x)?;
        let image_features = self.mm_projector.forward(&image_features)?;
        // llama runs in f32 around its quantized matmuls
        image_features.to_dtype(DType::F32)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub fn prepare_inputs_labels_for_multimodal(
        &self,
        input_ids: &[i64],
        images_tensors: &[Tensor],
    ) -> candle_core::Result<Tensor> {
        let concat_images = Tensor::cat(images_tensors, 0)?;
        let image_features_together = self.encode_images(&concat_images)?;
        let split_sizes = images_tensors
            .iter()
            .map(|x| x.dims()[0])
            .collect::<Vec<usize>>();
        // can be replaced by split
        let mut index_pos = 0;
        let mut image_features = Vec::new();
        for split_size in split_sizes.iter() {
            image_features.push(image_features_together.i(index_pos..index_pos + (*split_size))?);
            index_pos += *split_size;
        }

        // mm_patch_merge_type is "flat"
        let image_features = image_features
            .iter()
            .map(|x| x.flatten(0, 1))
            .collect::<candle_core::Result<Vec<Tensor>>>()?;

        let input_ids_noim = input_ids
            .iter()
            .filter(|x| **x != self.config.image_token_index)
            .map(|x| *x as u32)
            .collect::<Vec<u32>>();
        let input_ids_noim_len = input_ids_noim.len();
        let cur_input_embeds = self
            .llama
            .embed(&Tensor::from_vec(input_ids_noim, input_ids_noim_len, &self.device)?)?;

        let image_lens = image_features
            .iter()
            .map(|x| x.dims2().map(|(len, _)| len))
            .collect::<candle_core::Result<Vec<usize>>>()?;
        let max_length = self.config.max_length.min(self.llama.context_length());
        let segments = multimodal_layout(
            input_ids,
            self.config.image_token_index,
            &image_lens,
            max_length,
        )?;

        let mut cur_new_input_embeds = Vec::new();
        for segment in segments {
            match segment {
                EmbedSegment::Text(range) => {
                    cur_new_input_embeds.push(cur_input_embeds.i((range, ..))?)
                }
                EmbedSegment::Image { index, len } => {
                    cur_new_input_embeds.push(image_features[index].i((..len, ..))?)
                }
            }
        }
        let new_input_embeds = Tensor::cat(&cur_new_input_embeds, 0)?;

        new_input_embeds.unsqueeze(0)
    }

    /// Input prompt: "A photo of <image> next to <image>"
    /// Output: [bos_token_id, ...(tokens for "A photo of"), image_token_index, ...(tokens for " next to "), image_token_index]
    pub fn tokenizer_image_token(&self, prompt: &str) -> anyhow::Result<Vec<i64>> {
        let prompt_chunks = prompt
            .split(IMAGE_PLACEHOLDER)
            .map(|s| {
                self.tokenizer
                    .encode(s, true)
                    .map(|encoding| encoding.get_ids().iter().map(|x| *x as i64).collect())
                    .map_err(anyhow::Error::msg)
            })
            .collect::<anyhow::Result<Vec<Vec<i64>>>>()?;

        Ok(splice_image_tokens(
            prompt_chunks,
            self.config.bos_token_id as i64,
            self.config.image_token_index,
        ))
    }

    /// Caption one image. Only the newly generated text is returned.
    pub fn generate(
        &mut self,
        image: &DynamicImage,
        prompt: &str,
        max_new_tokens: usize,
        logits_processor: &mut LogitsProcessor,
    ) -> anyhow::Result<String> {
        let prompt = if prompt.contains(IMAGE_PLACEHOLDER) {
            prompt.to_string()
        } else {
            format_prompt(prompt)
        };

        let image_tensor = self
            .image_processor
            .preprocess(image)?
            .unsqueeze(0)?
            .to_device(&self.device)?
            .to_dtype(self.compute_dtype)?;
        let input_ids = self.tokenizer_image_token(&prompt)?;
        let input_embeds =
            self.prepare_inputs_labels_for_multimodal(&input_ids, &[image_tensor])?;

        let (_, prompt_len, _) = input_embeds.dims3()?;
        let max_length = self.config.max_length.min(self.llama.context_length());
        let eos_token_id = self.config.eos_token_id;
        let llama = &mut self.llama;
        let device = &self.device;

        let token_ids = generation_loop(
            prompt_len,
            max_new_tokens,
            max_length,
            eos_token_id,
            |last_token, index_pos| {
                let input_embeds = match last_token {
                    None => input_embeds.clone(),
                    Some(token) => llama.embed(&Tensor::new(&[token], device)?)?.unsqueeze(0)?,
                };
                let logits = llama.forward_input_embed(&input_embeds, index_pos)?;
                let logits = logits.squeeze(0)?.to_dtype(DType::F32)?;
                logits_processor.sample(&logits)
            },
        );
        self.llama.clear_kv_cache();
        let token_ids = token_ids?;

        let text = self
            .tokenizer
            .decode(&token_ids, true)
            .map_err(anyhow::Error::msg)?;

        Ok(text.trim().to_string())
    }
}

/// Piece of the llama input, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EmbedSegment {
    /// rows of the text embeddings, placeholders already removed
    Text(Range<usize>),
    /// first `len` rows of the features of image `index`
    Image { index: usize, len: usize },
}

/// Lay out text spans and image features the way the placeholders in
/// `input_ids` ask for, cut at `max_length` positions.
fn multimodal_layout(
    input_ids: &[i64],
    image_token_index: i64,
    image_lens: &[usize],
    max_length: usize,
) -> candle_core::Result<Vec<EmbedSegment>> {
    let image_positions = input_ids
        .iter()
        .enumerate()
        .filter(|(_, x)| **x == image_token_index)
        .map(|(i, _)| i)
        .collect::<Vec<usize>>();
    if image_positions.len() != image_lens.len() {
        candle_core::bail!(
            "prompt has {} image placeholders but {} images were given",
            image_positions.len(),
            image_lens.len()
        );
    }
    let text_len = input_ids.len() - image_positions.len();

    // text span i ends where placeholder i was, minus the placeholders before it
    let mut boundaries = vec![0_usize];
    for (removed, position) in image_positions.iter().enumerate() {
        boundaries.push(position - removed);
    }
    boundaries.push(text_len);

    let mut segments = vec![];
    let mut remaining = max_length;
    for i in 0..boundaries.len() - 1 {
        if remaining == 0 {
            break;
        }
        let (start, end) = (boundaries[i], boundaries[i + 1]);
        if end > start {
            let end = end.min(start + remaining);
            remaining -= end - start;
            segments.push(EmbedSegment::Text(start..end));
        }
        if let Some(len) = image_lens.get(i) {
            let len = (*len).min(remaining);
            if len > 0 {
                remaining -= len;
                segments.push(EmbedSegment::Image { index: i, len });
            }
        }
    }
    Ok(segments)
}

/// Autoregressive decoding over `next_token(last_token, index_pos)`.
///
/// The first call gets `None` and feeds the whole prompt of `prompt_len`
/// positions, later calls feed the previous token. Stops on eos, after
/// `max_new_tokens` tokens, or once the next input would not fit in
/// `max_length`. eos is not part of the result.
fn generation_loop<F>(
    prompt_len: usize,
    max_new_tokens: usize,
    max_length: usize,
    eos_token_id: u32,
    mut next_token: F,
) -> candle_core::Result<Vec<u32>>
where
    F: FnMut(Option<u32>, usize) -> candle_core::Result<u32>,
{
    let mut index_pos = 0;
    let mut seq_len = prompt_len;
    let mut last_token = None;
    let mut token_ids = vec![];

    for _ in 0..max_new_tokens {
        if index_pos + seq_len > max_length {
            tracing::debug!("context is full after {} tokens", token_ids.len());
            break;
        }
        let token = next_token(last_token, index_pos)?;
        index_pos += seq_len;

        if token == eos_token_id {
            break;
        }
        token_ids.push(token);
        last_token = Some(token);
        seq_len = 1;
    }

    Ok(token_ids)
}

fn is_4bit(dtype: candle_core::quantized::GgmlDType) -> bool {
    use candle_core::quantized::GgmlDType;
    matches!(dtype, GgmlDType::Q4_0 | GgmlDType::Q4_1 | GgmlDType::Q4K)
}

/// Joins tokenized prompt chunks with the image placeholder, keeping one leading bos.
/// Each chunk is expected to start with the bos the tokenizer adds.
fn splice_image_tokens(prompt_chunks: Vec<Vec<i64>>, bos_token_id: i64, image_token_index: i64) -> Vec<i64> {
    let mut input_ids = Vec::new();
    let mut offset = 0;
    if !prompt_chunks.is_empty()
        && !prompt_chunks[0].is_empty()
        && prompt_chunks[0][0] == bos_token_id
    {
        offset = 1;
        input_ids.push(prompt_chunks[0][0]);
    }

    for x in insert_separator(
        prompt_chunks,
        duplicate_vec(&[image_token_index], offset + 1),
    )
    .iter()
    {
        input_ids.extend(x.iter().skip(offset))
    }
    input_ids
}

fn duplicate_vec<T>(vec: &[T], n: usize) -> Vec<T>
where
    T: Clone,
{
    let mut res = Vec::new();
    for _ in 0..n {
        res.extend(vec.to_owned());
    }
    res
}

fn insert_separator<T>(x: Vec<Vec<T>>, sep: Vec<T>) -> Vec<Vec<T>>
where
    T: Clone,
{
    let sep = vec![sep];
    let sep = duplicate_vec(&sep, x.len());
    let mut res = x
        .iter()
        .zip(sep.iter())
        .flat_map(|(x, y)| vec![x.clone(), y.clone()])
        .collect::<Vec<Vec<T>>>();
    res.pop();
    res
}

/// llava_v1 conversation template
pub fn format_prompt(prompt: &str) -> String {
    format!(
        "USER: {image}\n{text_msg}\nASSISTANT:",
        image = IMAGE_PLACEHOLDER,
        text_msg = prompt,
    )
}

#[cfg(test)]
mod test {
    use super::{
        format_prompt, generation_loop, insert_separator, multimodal_layout, splice_image_tokens,
        EmbedSegment,
    };

    #[test]
    fn test_format_prompt() {
        assert_eq!(
            format_prompt("What is shown?"),
            "USER: <image>\nWhat is shown?\nASSISTANT:"
        );
    }

    #[test]
    fn test_insert_separator() {
        let res = insert_separator(vec![vec![1], vec![2], vec![3]], vec![0]);
        assert_eq!(res, vec![vec![1], vec![0], vec![2], vec![0], vec![3]]);
    }

    #[test]
    fn test_splice_image_tokens_single_bos() {
        // "USER: <image>\nhi" tokenized per chunk, each with a leading bos (1)
        let chunks = vec![vec![1, 11, 12], vec![1, 21, 22]];
        let ids = splice_image_tokens(chunks, 1, -200);
        assert_eq!(ids, vec![1, 11, 12, -200, 21, 22]);
    }

    #[test]
    fn test_splice_image_tokens_without_bos() {
        let chunks = vec![vec![11], vec![21]];
        let ids = splice_image_tokens(chunks, 1, -200);
        assert_eq!(ids, vec![11, -200, 21]);
    }

    #[test]
    fn test_layout_one_image() {
        let segments = multimodal_layout(&[1, 11, -200, 21, 22], -200, &[576], 4096).unwrap();
        assert_eq!(
            segments,
            vec![
                EmbedSegment::Text(0..2),
                EmbedSegment::Image { index: 0, len: 576 },
                EmbedSegment::Text(2..4),
            ]
        );
    }

    #[test]
    fn test_layout_two_images() {
        let segments = multimodal_layout(&[1, -200, 11, -200, 21], -200, &[3, 4], 4096).unwrap();
        assert_eq!(
            segments,
            vec![
                EmbedSegment::Text(0..1),
                EmbedSegment::Image { index: 0, len: 3 },
                EmbedSegment::Text(1..2),
                EmbedSegment::Image { index: 1, len: 4 },
                EmbedSegment::Text(2..3),
            ]
        );
    }

    #[test]
    fn test_layout_image_first() {
        let segments = multimodal_layout(&[-200, 11, 12], -200, &[4], 4096).unwrap();
        assert_eq!(
            segments,
            vec![
                EmbedSegment::Image { index: 0, len: 4 },
                EmbedSegment::Text(0..2),
            ]
        );
    }

    #[test]
    fn test_layout_truncated_to_context() {
        // 4 text positions and 10 image positions into 5
        let segments = multimodal_layout(&[1, 11, -200, 21, 22], -200, &[10], 5).unwrap();
        assert_eq!(
            segments,
            vec![
                EmbedSegment::Text(0..2),
                EmbedSegment::Image { index: 0, len: 3 },
            ]
        );

        let segments = multimodal_layout(&[1, 11, -200, 21, 22], -200, &[10], 1).unwrap();
        assert_eq!(segments, vec![EmbedSegment::Text(0..1)]);
    }

    #[test]
    fn test_layout_placeholder_count_mismatch() {
        assert!(multimodal_layout(&[1, -200, 11], -200, &[3, 3], 4096).is_err());
        assert!(multimodal_layout(&[1, 11], -200, &[3], 4096).is_err());
    }

    #[test]
    fn test_generation_stops_on_eos() {
        let mut outputs = vec![5, 6, 2, 7].into_iter();
        let mut calls = vec![];
        let tokens = generation_loop(8, 100, 4096, 2, |last_token, index_pos| {
            calls.push((last_token, index_pos));
            Ok(outputs.next().unwrap())
        })
        .unwrap();

        assert_eq!(tokens, vec![5, 6]);
        assert_eq!(calls, vec![(None, 0), (Some(5), 8), (Some(6), 9)]);
    }

    #[test]
    fn test_generation_stops_at_max_new_tokens() {
        let mut calls = 0;
        let tokens = generation_loop(8, 3, 4096, 2, |_, _| {
            calls += 1;
            Ok(9)
        })
        .unwrap();

        assert_eq!(tokens, vec![9, 9, 9]);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_generation_stops_when_context_is_full() {
        // prompt fills 0..8, then one position per token up to 10
        let mut positions = vec![];
        let tokens = generation_loop(8, 100, 10, 2, |_, index_pos| {
            positions.push(index_pos);
            Ok(9)
        })
        .unwrap();

        assert_eq!(positions, vec![0, 8, 9]);
        assert_eq!(tokens, vec![9, 9, 9]);

        let tokens = generation_loop(11, 100, 10, 2, |_, _| Ok(9)).unwrap();
        assert!(tokens.is_empty());
    }

    #[test]
    fn test_generation_error_is_returned() {
        let res = generation_loop(8, 100, 4096, 2, |last_token, _| match last_token {
            None => Ok(9),
            Some(_) => candle_core::bail!("forward failed"),
        });
        assert!(res.is_err());
    }
}
