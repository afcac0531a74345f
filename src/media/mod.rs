//! Media lookup under the configured root

pub mod resolver;

pub use resolver::{MediaResolver, MediaTarget};
