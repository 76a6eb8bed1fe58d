// Copyright 2025 Irreducible Inc.

//! Layer trees for binary and stochastic LUT networks: the layer contract, the typed command
//! bus, composite layers with train/inference switching and checkpointed backward passes.

mod activation;
mod batch_norm;
mod binary_modulation;
mod command;
mod error;
mod info;
mod layer;
mod lut;
mod modulation;
mod optim;
mod sequential;
mod sparse_lut;
mod stochastic_lut;
mod variables;

pub use activation::*;
pub use batch_norm::*;
pub use binary_modulation::*;
pub use command::*;
pub use error::*;
pub use info::*;
pub use layer::*;
pub use lut::*;
pub use modulation::*;
pub use optim::*;
pub use sequential::*;
pub use sparse_lut::*;
pub use stochastic_lut::*;
pub use variables::*;
