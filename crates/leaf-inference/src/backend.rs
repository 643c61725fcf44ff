//! Backend selection
//!
//! CUDA when the `cuda` feature is enabled, the NdArray CPU backend otherwise.
//! Inference never needs gradients, so there is no autodiff wrapper here.

use burn::tensor::backend::Backend;

#[cfg(feature = "cuda")]
pub type InferenceBackend = burn_cuda::Cuda;

#[cfg(not(feature = "cuda"))]
pub type InferenceBackend = burn_ndarray::NdArray;

/// Get the default device for the current backend
pub fn default_device() -> <InferenceBackend as Backend>::Device {
    <InferenceBackend as Backend>::Device::default()
}

/// Get a human-readable name for the current backend
pub fn backend_name() -> &'static str {
    #[cfg(feature = "cuda")]
    {
        "CUDA (GPU)"
    }

    #[cfg(not(feature = "cuda"))]
    {
        "NdArray (CPU)"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_available() {
        let _device = default_device();
        assert!(!backend_name().is_empty());
    }
}
