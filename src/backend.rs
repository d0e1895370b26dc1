//! Compile-time backend selection shared by the training binaries.

use burn::backend::Autodiff;

#[cfg(not(any(feature = "wgpu-backend", feature = "tch-backend")))]
pub type TrainBackend = Autodiff<burn_ndarray::NdArray<f32>>;

#[cfg(all(feature = "wgpu-backend", not(feature = "tch-backend")))]
pub type TrainBackend = Autodiff<burn_wgpu::Wgpu>;

#[cfg(feature = "tch-backend")]
pub type TrainBackend = Autodiff<burn_tch::LibTorch<f32>>;

/// Accelerator tag reported by precision plugins.
#[cfg(not(any(feature = "wgpu-backend", feature = "tch-backend")))]
pub const ACCELERATOR: &str = "cpu";

#[cfg(all(feature = "wgpu-backend", not(feature = "tch-backend")))]
pub const ACCELERATOR: &str = "gpu";

#[cfg(feature = "tch-backend")]
pub const ACCELERATOR: &str = "cuda";
