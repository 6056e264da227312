use candle_core::{DType, Device, Result, Tensor};
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};

/// CLIP image processor as LLaVA 1.5 uses it with `image_aspect_ratio = "pad"`.
///
/// It only covers the preprocessing of "openai/clip-vit-large-patch14-336" and
/// is not fully compatible with python transformers' CLIPImageProcessor.
#[derive(Debug, Clone)]
pub struct ImageProcessor {
    pub size: u32, // shortest edge after resize
    pub do_resize: bool,
    // resample is 3 in python, PIL bicubic, equivalent to rust CatmullRom
    pub do_center_crop: bool,
    pub crop_size: u32,
    pub do_rescale: bool,
    pub rescale_factor: f32,
    pub do_normalize: bool,
    pub image_mean: Vec<f32>,
    pub image_std: Vec<f32>,
    pub do_pad_to_square: bool,
}

impl Default for ImageProcessor {
    fn default() -> Self {
        Self {
            size: 336,
            do_resize: true,
            do_center_crop: true,
            crop_size: 336,
            do_rescale: true,
            rescale_factor: 1.0 / 255.0,
            do_normalize: true,
            image_mean: vec![0.48145466, 0.4578275, 0.40821073],
            image_std: vec![0.26862954, 0.2613026, 0.2757771],
            do_pad_to_square: true,
        }
    }
}

impl ImageProcessor {
    /// Pad the shorter side so the image sits centered on a square canvas
    /// filled with the mean color.
    pub fn expand_to_square(&self, image: &DynamicImage) -> DynamicImage {
        let (width, height) = image.dimensions();
        if width == height {
            return image.clone();
        }

        let background = Rgb([
            (self.image_mean[0] * 255.0) as u8,
            (self.image_mean[1] * 255.0) as u8,
            (self.image_mean[2] * 255.0) as u8,
        ]);
        let side = width.max(height);
        let mut canvas = RgbImage::from_pixel(side, side, background);
        let (left, top) = ((side - width) / 2, (side - height) / 2);
        image::imageops::overlay(
            &mut canvas,
            &image.to_rgb8(),
            left as i64,
            top as i64,
        );
        DynamicImage::ImageRgb8(canvas)
    }

    /// Longest edge to self.size, keeping the aspect ratio.
    ///
    /// Padding after this gives the same geometry as padding first and
    /// resizing the square, but the canvas never exceeds size x size.
    pub fn fit_longest_edge(&self, image: &DynamicImage) -> DynamicImage {
        let (width, height) = image.dimensions();
        let longest = width.max(height);
        if longest == self.size {
            return image.clone();
        }
        let scale = |edge: u32| -> u32 {
            (((edge as u64 * self.size as u64) as f64 / longest as f64).round() as u32).max(1)
        };
        image.resize_exact(
            scale(width),
            scale(height),
            image::imageops::FilterType::CatmullRom,
        )
    }

    /// shortest edge to self.size, other edge is resized to maintain aspect ratio
    pub fn resize(&self, image: &DynamicImage) -> DynamicImage {
        let (width, height) = image.dimensions();
        let size = self.size;
        if width == size && height == size {
            image.clone()
        } else {
            let (new_width, new_height) = if width < height {
                (
                    size,
                    (((size * height) as f32) / width as f32).ceil() as u32,
                )
            } else {
                (
                    (((size * width) as f32) / height as f32).ceil() as u32,
                    size,
                )
            };
            image.resize_exact(
                new_width,
                new_height,
                image::imageops::FilterType::CatmullRom,
            )
        }
    }

    pub fn center_crop(&self, image: &DynamicImage) -> DynamicImage {
        let (width, height) = image.dimensions();
        let crop_size = self.crop_size;
        let (left, top) = calculate_middle((width, height), (crop_size, crop_size));
        image.crop_imm(left, top, crop_size, crop_size)
    }

    pub fn to_tensor(&self, image: &DynamicImage) -> Result<Tensor> {
        let img = image.to_rgb8().into_raw();
        let (width, height) = image.dimensions();
        Tensor::from_vec(img, (height as usize, width as usize, 3), &Device::Cpu)?
            .to_dtype(DType::F32) // only for internal compute
    }

    pub fn rescale(&self, tensor: &Tensor) -> Result<Tensor> {
        let rescale_factor = self.rescale_factor as f64;
        tensor.affine(rescale_factor, 0.0)
    }

    pub fn normalize(&self, tensor: &Tensor) -> Result<Tensor> {
        let mean = Tensor::from_slice(&self.image_mean, (3,), &Device::Cpu)?;
        let std = Tensor::from_slice(&self.image_std, (3,), &Device::Cpu)?;
        tensor.broadcast_sub(&mean)?.broadcast_div(&std)
    }

    pub fn to_channel_dimension_format(&self, tensor: &Tensor) -> Result<Tensor> {
        tensor.permute((2, 0, 1))
    }

    /// Returns a (3, crop_size, crop_size) f32 tensor on the cpu.
    pub fn preprocess(&self, image: &DynamicImage) -> Result<Tensor> {
        let image = if self.do_pad_to_square {
            self.expand_to_square(&self.fit_longest_edge(image))
        } else {
            image.clone()
        };
        let image = if self.do_resize {
            self.resize(&image)
        } else {
            image
        };
        let image = if self.do_center_crop {
            self.center_crop(&image)
        } else {
            image
        };
        let tensor = self.to_tensor(&image)?;
        let tensor = if self.do_rescale {
            self.rescale(&tensor)?
        } else {
            tensor
        };
        let tensor = if self.do_normalize {
            self.normalize(&tensor)?
        } else {
            tensor
        };
        self.to_channel_dimension_format(&tensor)
    }
}

pub fn calculate_middle(image_size: (u32, u32), center_size: (u32, u32)) -> (u32, u32) {
    let (width, height) = image_size;
    let (center_width, center_height) = center_size;
    let left = if width <= center_width {
        0
    } else {
        ((width as f32 - center_width as f32) / 2.0).ceil() as u32
    };
    let top = if height <= center_height {
        0
    } else {
        ((height as f32 - center_height as f32) / 2.0).ceil() as u32
    };
    (left, top)
}
