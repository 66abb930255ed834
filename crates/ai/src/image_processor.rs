use candle_core::{DType, Device, Result, Tensor};
use image::{imageops::FilterType, DynamicImage, GenericImageView, Rgb, RgbImage};
use serde::Deserialize;
use std::collections::HashMap;

/// Subset of a HuggingFace `preprocessor_config.json`.
#[derive(Deserialize, Debug, Clone)]
pub struct PreProcessorConfig {
    pub crop_size: HashMap<String, usize>,
    pub do_center_crop: bool,
    pub do_normalize: bool,
    pub do_rescale: bool,
    pub do_resize: bool,
    pub image_mean: Vec<f32>,
    pub image_std: Vec<f32>,
    pub rescale_factor: f32,
    pub size: HashMap<String, f32>,
}

/// CLIP style preprocessing as used by LLaVA checkpoints. `size` is the
/// shortest edge after resizing and `crop_size` the square center crop.
#[derive(Deserialize, Debug, Clone)]
pub struct ImageProcessor {
    #[serde(default = "default_size")]
    pub size: u32,
    #[serde(default = "default_true")]
    pub do_resize: bool,
    #[serde(default = "default_true")]
    pub do_center_crop: bool,
    #[serde(default = "default_size")]
    pub crop_size: u32,
    #[serde(default = "default_true")]
    pub do_rescale: bool,
    #[serde(default = "default_rescale_factor")]
    pub rescale_factor: f32,
    #[serde(default = "default_true")]
    pub do_normalize: bool,
    #[serde(default = "default_image_mean")]
    pub image_mean: Vec<f32>,
    #[serde(default = "default_image_std")]
    pub image_std: Vec<f32>,
}

fn default_size() -> u32 {
    336
}

fn default_true() -> bool {
    true
}

fn default_rescale_factor() -> f32 {
    1.0 / 255.0
}

fn default_image_mean() -> Vec<f32> {
    vec![0.48145466, 0.4578275, 0.40821073]
}

fn default_image_std() -> Vec<f32> {
    vec![0.26862954, 0.2613026, 0.2757771]
}

impl Default for ImageProcessor {
    fn default() -> Self {
        Self {
            size: default_size(),
            do_resize: true,
            do_center_crop: true,
            crop_size: default_size(),
            do_rescale: true,
            rescale_factor: default_rescale_factor(),
            do_normalize: true,
            image_mean: default_image_mean(),
            image_std: default_image_std(),
        }
    }
}

impl ImageProcessor {
    pub fn from_hf_preprocessor_config(config: &PreProcessorConfig) -> Self {
        let defaults = Self::default();
        Self {
            size: config
                .size
                .get("shortest_edge")
                .map(|v| *v as u32)
                .unwrap_or(defaults.size),
            do_resize: config.do_resize,
            do_center_crop: config.do_center_crop,
            crop_size: config
                .crop_size
                .get("height")
                .map(|v| *v as u32)
                .unwrap_or(defaults.crop_size),
            do_rescale: config.do_rescale,
            rescale_factor: config.rescale_factor,
            do_normalize: config.do_normalize,
            image_mean: config.image_mean.clone(),
            image_std: config.image_std.clone(),
        }
    }

    /// Shortest edge to `self.size`, the other edge keeps the aspect ratio.
    pub fn resize(&self, image: &DynamicImage) -> DynamicImage {
        let (width, height) = image.dimensions();
        let size = self.size;
        if width == size && height == size {
            image.clone()
        } else {
            let (new_width, new_height) = if width < height {
                (size, ((size * height) as f32 / width as f32).ceil() as u32)
            } else {
                (((size * width) as f32 / height as f32).ceil() as u32, size)
            };
            image.resize_exact(new_width, new_height, FilterType::CatmullRom)
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
            .to_dtype(DType::F32)
    }

    pub fn rescale(&self, tensor: &Tensor) -> Result<Tensor> {
        tensor.affine(self.rescale_factor as f64, 0.0)
    }

    pub fn normalize(&self, tensor: &Tensor) -> Result<Tensor> {
        let mean = Tensor::from_vec(self.image_mean.clone(), (3,), &Device::Cpu)?;
        let std = Tensor::from_vec(self.image_std.clone(), (3,), &Device::Cpu)?;
        tensor.broadcast_sub(&mean)?.broadcast_div(&std)
    }

    /// (height, width, channel) to (channel, height, width)
    pub fn to_channel_dimension_format(&self, tensor: &Tensor) -> Result<Tensor> {
        tensor.permute((2, 0, 1))
    }

    pub fn preprocess(&self, image: &DynamicImage) -> Result<Tensor> {
        let image = if self.do_resize {
            self.resize(image)
        } else {
            image.clone()
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

    /// Returns a `(patches, 3, crop_size, crop_size)` tensor on the CPU.
    ///
    /// `square` feeds the image as is, `pad` first pads it to a square filled
    /// with the mean color, anything else is treated as `anyres`: the image is
    /// fitted to the best grid resolution and split into crop sized patches
    /// behind a downscaled overview.
    pub fn process(
        &self,
        image: &DynamicImage,
        aspect_ratio: &str,
        grid_pinpoints: &[(u32, u32)],
    ) -> Result<Tensor> {
        match aspect_ratio {
            "square" => self.preprocess(image)?.unsqueeze(0),
            "pad" => {
                let background = Rgb([
                    mean_channel(&self.image_mean, 0),
                    mean_channel(&self.image_mean, 1),
                    mean_channel(&self.image_mean, 2),
                ]);
                self.preprocess(&expand_to_square(image, background))?
                    .unsqueeze(0)
            }
            _ => self.process_anyres(image, grid_pinpoints),
        }
    }

    /// Resizes to exactly `width` x `height` with no crop, as SigLIP towers
    /// expect. Returns a `(1, 3, height, width)` tensor on the CPU.
    pub fn process_fixed_size(
        &self,
        image: &DynamicImage,
        width: u32,
        height: u32,
    ) -> Result<Tensor> {
        let image = image.resize_exact(width, height, FilterType::CatmullRom);
        let processor = Self {
            do_resize: false,
            do_center_crop: false,
            ..self.clone()
        };
        processor.preprocess(&image)?.unsqueeze(0)
    }

    fn process_anyres(&self, image: &DynamicImage, grid_pinpoints: &[(u32, u32)]) -> Result<Tensor> {
        let best_resolution = select_best_resolution(image.dimensions(), grid_pinpoints)
            .unwrap_or((self.crop_size, self.crop_size));
        let image_padded = resize_and_pad_image(image, best_resolution);
        let overview = image.resize_exact(self.size, self.size, FilterType::CatmullRom);

        let mut tensors = vec![self.preprocess(&overview)?.unsqueeze(0)?];
        for patch in divide_to_patches(&image_padded, self.crop_size) {
            tensors.push(self.preprocess(&patch)?.unsqueeze(0)?);
        }
        Tensor::cat(&tensors, 0)
    }
}

fn mean_channel(mean: &[f32], index: usize) -> u8 {
    let value = mean.get(index).copied().unwrap_or(0.5);
    (value * 255.0).round().clamp(0.0, 255.0) as u8
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

/// Picks the grid resolution that keeps the most image pixels, preferring the
/// one with less padding on ties.
pub fn select_best_resolution(
    original_size: (u32, u32),
    possible_resolutions: &[(u32, u32)],
) -> Option<(u32, u32)> {
    let (original_width, original_height) = original_size;
    let mut best_fit = None;
    let mut max_effective_resolution = 0;
    let mut min_wasted_resolution = u32::MAX;

    for &(width, height) in possible_resolutions {
        let scale = f32::min(
            width as f32 / original_width as f32,
            height as f32 / original_height as f32,
        );
        let downscaled_width = (original_width as f32 * scale) as u32;
        let downscaled_height = (original_height as f32 * scale) as u32;
        let effective_resolution = u32::min(
            downscaled_width * downscaled_height,
            original_width * original_height,
        );
        let wasted_resolution = (width * height).saturating_sub(effective_resolution);
        if effective_resolution > max_effective_resolution
            || (effective_resolution == max_effective_resolution
                && wasted_resolution < min_wasted_resolution)
        {
            max_effective_resolution = effective_resolution;
            min_wasted_resolution = wasted_resolution;
            best_fit = Some((width, height));
        }
    }
    best_fit
}

pub fn resize_and_pad_image(image: &DynamicImage, target_resolution: (u32, u32)) -> DynamicImage {
    let (original_width, original_height) = image.dimensions();
    let (target_width, target_height) = target_resolution;
    let scale_w = target_width as f32 / original_width as f32;
    let scale_h = target_height as f32 / original_height as f32;
    let (new_width, new_height) = if scale_w < scale_h {
        (
            target_width,
            u32::min(
                (original_height as f32 * scale_w).ceil() as u32,
                target_height,
            ),
        )
    } else {
        (
            u32::min((original_width as f32 * scale_h).ceil() as u32, target_width),
            target_height,
        )
    };
    let resized = image.resize_exact(new_width, new_height, FilterType::CatmullRom);
    let mut canvas = RgbImage::new(target_width, target_height);
    let (paste_x, paste_y) =
        calculate_middle((target_width, target_height), (new_width, new_height));
    image::imageops::overlay(
        &mut canvas,
        &resized.to_rgb8(),
        paste_x as i64,
        paste_y as i64,
    );
    DynamicImage::ImageRgb8(canvas)
}

pub fn divide_to_patches(image: &DynamicImage, patch_size: u32) -> Vec<DynamicImage> {
    let (width, height) = image.dimensions();
    let mut patches = Vec::new();
    for y in (0..height).step_by(patch_size as usize) {
        for x in (0..width).step_by(patch_size as usize) {
            patches.push(image.crop_imm(x, y, patch_size, patch_size));
        }
    }
    patches
}

pub fn expand_to_square(image: &DynamicImage, background: Rgb<u8>) -> DynamicImage {
    let (width, height) = image.dimensions();
    if width == height {
        return image.clone();
    }
    let size = width.max(height);
    let mut canvas = RgbImage::from_pixel(size, size, background);
    image::imageops::overlay(
        &mut canvas,
        &image.to_rgb8(),
        ((size - width) / 2) as i64,
        ((size - height) / 2) as i64,
    );
    DynamicImage::ImageRgb8(canvas)
}
