pub mod anchors;
pub mod loader;
pub mod options;
pub mod request;
pub mod session;
pub mod shared;
pub mod stepio;
pub mod worker;

pub use anchors::*;
pub use loader::*;
pub use options::*;
pub use request::*;
pub use session::*;
pub use shared::*;
pub use stepio::*;
pub use worker::*;
