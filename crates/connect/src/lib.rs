// Copyright 2025 Irreducible Inc.

//! Fixed fan-in connection tables between sparse layers and the rules that generate them.

mod error;
mod generate;
mod shuffle;
mod table;

pub use error::*;
pub use generate::*;
pub use shuffle::*;
pub use table::*;
