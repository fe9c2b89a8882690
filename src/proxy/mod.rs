pub mod manager;

pub use manager::{ProxyManager, ProxySelection, RotationStrategy};
