//! Platform-authored builtin strategies.

mod momentum;

pub use momentum::MomentumStrategy;
