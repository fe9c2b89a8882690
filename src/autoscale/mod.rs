pub mod pool;
pub mod snapshotter;

pub use pool::{next_concurrency, AutoscaledPool, PoolHandle, PoolOptions, PoolTask, ScalingInput, ScalingLimits};
pub use snapshotter::{LoadThresholds, MemoryProbe, ResourceSnapshot, Snapshotter, SystemMemoryProbe};
