pub mod managed;

pub use managed::{FirstFrameHook, ManagedSource};
