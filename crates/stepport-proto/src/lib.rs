pub mod builder;
pub mod codec;
pub mod onnx;

pub use builder::*;
pub use codec::*;
