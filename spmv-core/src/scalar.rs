use bytemuck::Pod;
use num_traits::Float;

/// Element type a device kernel can multiply with.
///
/// Host devices accept every implementor; GPU devices are limited to the
/// types WGSL can express (no f64 in WebGPU), which `GPU_CAPABLE` records.
pub trait Scalar:
    Float + Pod + Default + std::fmt::Debug + std::fmt::Display + Send + Sync + 'static
{
    /// WGSL spelling of the type, used in kernel cache keys.
    const WGSL_NAME: &'static str;
    /// Whether WGSL compute shaders can operate on this type.
    const GPU_CAPABLE: bool;

    /// Narrowing for uniform parameter blocks; only called on the GPU path,
    /// where the type is f32 already.
    fn to_f32(self) -> f32;
}

impl Scalar for f32 {
    const WGSL_NAME: &'static str = "f32";
    const GPU_CAPABLE: bool = true;

    fn to_f32(self) -> f32 {
        self
    }
}

impl Scalar for f64 {
    const WGSL_NAME: &'static str = "f64";
    const GPU_CAPABLE: bool = false;

    fn to_f32(self) -> f32 {
        self as f32
    }
}
