//! Bindings generated from `model.proto`.

include!(concat!(env!("OUT_DIR"), "/stepport.onnx.rs"));

/// ONNX `AttributeProto.AttributeType` values used here.
pub mod attribute_type {
    pub const FLOAT: i32 = 1;
    pub const INT: i32 = 2;
}
