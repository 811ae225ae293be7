pub mod anchor;
pub mod artifact;
pub mod backend;
pub mod dataflow;
pub mod error;
pub mod optim;
pub mod spec;
pub mod tensor;
pub mod weights;

pub use anchor::*;
pub use artifact::*;
pub use backend::*;
pub use dataflow::*;
pub use error::*;
pub use optim::*;
pub use spec::*;
pub use tensor::*;
pub use weights::*;
