//! # Device Layer
//!
//! Buffers, command queues and sparse kernels over two backends: host
//! worker lanes running rayon kernels, and wgpu compute queues. Each
//! device exposes a primary lane for kernels and a transfer lane for
//! staging, with completion handles tying the two together.

pub mod buffer;
pub mod context;
pub mod error;
pub mod event;
mod gpu;
mod host;
mod kernel;
pub mod ops;
pub mod queue;
pub mod scalar;

pub use buffer::DeviceBuffer;
pub use context::{ComputeContext, ContextId, DeviceClass, TransferStats};
pub use error::CoreError;
pub use event::{Completion, TransferHandle};
pub use kernel::WORKGROUP_SIZE;
pub use ops::{CcsrDeviceSlice, CsrDeviceSlice, EllDeviceSlice, ELL_SENTINEL};
pub use queue::DeviceQueue;
pub use scalar::Scalar;
