// Copyright 2025 Irreducible Inc.

//! Frame buffers, host/device residency and the elementwise kernels shared by both paths.

mod buffer;
mod context;
pub mod cpu;
mod device;
mod dtype;
mod error;
pub mod kernels;
pub mod ops;
mod shape;
mod tensor;

pub use buffer::*;
pub use context::*;
pub use device::*;
pub use dtype::*;
pub use error::*;
pub use kernels::Kernel;
pub use shape::*;
pub use tensor::*;
