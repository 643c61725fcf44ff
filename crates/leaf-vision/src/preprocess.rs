//! Image preprocessing for model input.
//!
//! Turns an arbitrary decoded image into the fixed-shape tensor the
//! classifier expects: resized to the model resolution, expanded to three
//! channels, scaled to `[0, 1]`, arranged in the model's channel order, with
//! a leading batch axis of one.

use image::imageops::FilterType;
use image::DynamicImage;
use leaf_core::{
    ChannelOrder, ImageDimensions, PreparedTensor, PreprocessConfig, PreprocessError, ResizeFilter,
};
use tracing::debug;

use crate::loader;

/// Image preprocessor for leaf images
#[derive(Debug, Clone)]
pub struct Preprocessor {
    target: ImageDimensions,
    channel_order: ChannelOrder,
    filter: FilterType,
}

impl Preprocessor {
    /// Creates a preprocessor from its configuration
    pub fn new(config: &PreprocessConfig) -> Self {
        Self {
            target: config.dimensions(),
            channel_order: config.channel_order,
            filter: filter_type(config.filter),
        }
    }

    /// 224x224 preprocessor with the given channel order
    pub fn imagenet(channel_order: ChannelOrder) -> Self {
        Self::new(&PreprocessConfig::new(channel_order))
    }

    pub fn channel_order(&self) -> ChannelOrder {
        self.channel_order
    }

    /// Shape of every tensor this preprocessor produces, `[1, H, W, 3]`
    pub fn output_shape(&self) -> [usize; 4] {
        [
            1,
            self.target.height as usize,
            self.target.width as usize,
            PreparedTensor::CHANNELS,
        ]
    }

    /// Preprocesses a decoded image.
    pub fn prepare(&self, image: &DynamicImage) -> Result<PreparedTensor, PreprocessError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(PreprocessError::UnsupportedFormat("image has no pixels".into()));
        }

        // Resize in the image's own colour space, then expand. `to_rgb8`
        // replicates a luma channel into R, G and B and drops alpha.
        let resized = image.resize_exact(self.target.width, self.target.height, self.filter);
        let rgb = resized.to_rgb8();

        let mut data = Vec::with_capacity(self.target.total_values());
        for pixel in rgb.pixels() {
            for value in self.channel_order.arrange(pixel.0) {
                data.push(value as f32 / 255.0);
            }
        }

        let tensor = PreparedTensor::new(
            data,
            self.target.height as usize,
            self.target.width as usize,
            self.channel_order,
        )
        .ok_or_else(|| {
            PreprocessError::UnsupportedFormat(
                "image could not be converted to a pixel grid".into(),
            )
        })?;

        let (min, max, mean) = tensor.stats();
        debug!(
            "Prepared {}x{} {:?} image -> {:?} ({}), min={:.3} max={:.3} mean={:.3}",
            image.width(),
            image.height(),
            image.color(),
            tensor.shape(),
            self.channel_order,
            min,
            max,
            mean
        );

        Ok(tensor)
    }

    /// Decodes and preprocesses encoded image bytes.
    pub fn prepare_bytes(&self, bytes: &[u8]) -> Result<PreparedTensor, PreprocessError> {
        let image = loader::decode_bytes(bytes)?;
        self.prepare(&image)
    }

    /// Decodes and preprocesses an image file.
    pub fn prepare_file(&self, path: &std::path::Path) -> Result<PreparedTensor, PreprocessError> {
        let image = loader::decode_file(path)?;
        self.prepare(&image)
    }
}

fn filter_type(filter: ResizeFilter) -> FilterType {
    match filter {
        ResizeFilter::Nearest => FilterType::Nearest,
        ResizeFilter::Triangle => FilterType::Triangle,
        ResizeFilter::CatmullRom => FilterType::CatmullRom,
        ResizeFilter::Gaussian => FilterType::Gaussian,
        ResizeFilter::Lanczos3 => FilterType::Lanczos3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, ImageBuffer, Luma, LumaA, Rgb, Rgba};

    fn assert_model_shape(tensor: &PreparedTensor) {
        assert_eq!(tensor.shape(), [1, 224, 224, 3]);
        assert_eq!(tensor.as_slice().len(), 224 * 224 * 3);
        assert!(tensor.as_slice().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_output_shape() {
        let preprocessor = Preprocessor::imagenet(ChannelOrder::Rgb);
        assert_eq!(preprocessor.output_shape(), [1, 224, 224, 3]);
    }

    #[test]
    fn test_shape_invariant_across_inputs() {
        let preprocessor = Preprocessor::imagenet(ChannelOrder::Bgr);

        let inputs = vec![
            DynamicImage::ImageRgb8(ImageBuffer::from_pixel(10, 10, Rgb([255u8, 0, 0]))),
            DynamicImage::ImageRgb8(ImageBuffer::from_pixel(640, 480, Rgb([1u8, 2, 3]))),
            DynamicImage::ImageRgba8(ImageBuffer::from_pixel(300, 17, Rgba([9u8, 8, 7, 0]))),
            DynamicImage::ImageLuma8(GrayImage::from_pixel(1, 1, Luma([77u8]))),
            DynamicImage::ImageLumaA8(ImageBuffer::from_pixel(50, 90, LumaA([200u8, 255]))),
            DynamicImage::ImageRgb8(ImageBuffer::from_pixel(224, 224, Rgb([255u8, 255, 255]))),
        ];

        for image in &inputs {
            let tensor = preprocessor.prepare(image).unwrap();
            assert_model_shape(&tensor);
        }
    }

    #[test]
    fn test_grayscale_is_replicated_to_three_channels() {
        let preprocessor = Preprocessor::imagenet(ChannelOrder::Rgb);
        let gray = DynamicImage::ImageLuma8(GrayImage::from_pixel(32, 32, Luma([51u8])));

        let tensor = preprocessor.prepare(&gray).unwrap();
        assert_model_shape(&tensor);

        let expected = 51.0 / 255.0;
        for (y, x) in [(0, 0), (100, 57), (223, 223)] {
            for c in 0..3 {
                assert!((tensor.value(y, x, c) - expected).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_values_are_scaled_by_255() {
        let preprocessor = Preprocessor::imagenet(ChannelOrder::Rgb);
        let image = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(224, 224, Rgb([255u8, 0, 51])));

        let tensor = preprocessor.prepare(&image).unwrap();
        assert_eq!(tensor.value(10, 10, 0), 1.0);
        assert_eq!(tensor.value(10, 10, 1), 0.0);
        assert!((tensor.value(10, 10, 2) - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_bgr_swaps_first_and_last_channel() {
        let image =
            DynamicImage::ImageRgb8(ImageBuffer::from_pixel(224, 224, Rgb([255u8, 128, 0])));

        let rgb = Preprocessor::imagenet(ChannelOrder::Rgb).prepare(&image).unwrap();
        let bgr = Preprocessor::imagenet(ChannelOrder::Bgr).prepare(&image).unwrap();

        assert_eq!(bgr.channel_order(), ChannelOrder::Bgr);
        assert_eq!(rgb.value(5, 5, 0), bgr.value(5, 5, 2));
        assert_eq!(rgb.value(5, 5, 1), bgr.value(5, 5, 1));
        assert_eq!(rgb.value(5, 5, 2), bgr.value(5, 5, 0));
        assert_eq!(bgr.value(5, 5, 0), 0.0);
    }

    #[test]
    fn test_prepare_is_deterministic() {
        let preprocessor = Preprocessor::imagenet(ChannelOrder::Rgb);
        let image = DynamicImage::ImageRgb8(ImageBuffer::from_fn(97, 61, |x, y| {
            Rgb([(x * 2) as u8, (y * 3) as u8, ((x + y) % 256) as u8])
        }));

        assert_eq!(preprocessor.prepare(&image).unwrap(), preprocessor.prepare(&image).unwrap());
    }

    #[test]
    fn test_zero_sized_image_is_rejected() {
        let preprocessor = Preprocessor::imagenet(ChannelOrder::Rgb);
        let empty = DynamicImage::new_rgb8(0, 0);
        assert!(matches!(
            preprocessor.prepare(&empty),
            Err(PreprocessError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_prepare_bytes_rejects_garbage() {
        let preprocessor = Preprocessor::imagenet(ChannelOrder::Rgb);
        assert!(matches!(
            preprocessor.prepare_bytes(b"\x00\x01\x02 not an image"),
            Err(PreprocessError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_custom_resolution() {
        let mut config = PreprocessConfig::new(ChannelOrder::Rgb);
        config.width = 128;
        config.height = 96;
        let preprocessor = Preprocessor::new(&config);

        let image = DynamicImage::new_rgb8(300, 300);
        let tensor = preprocessor.prepare(&image).unwrap();
        assert_eq!(tensor.shape(), [1, 96, 128, 3]);
    }
}
