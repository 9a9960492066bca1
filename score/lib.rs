#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod design;
pub mod model;
pub mod threshold;
#[path = "../shared/matrix.rs"]
pub mod shared_matrix;
pub mod shared {
    pub use super::shared_matrix as matrix;
}

#[path = "../meta/mod.rs"]
pub mod meta;

#[path = "../catalog/mod.rs"]
pub mod catalog;
