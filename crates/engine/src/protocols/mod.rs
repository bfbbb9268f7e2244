//! Concrete protocols run by the engine.

pub mod channel_creation;
pub mod children;
