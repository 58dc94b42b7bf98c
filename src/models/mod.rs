pub mod origin;
pub mod proxy;

pub use origin::*;
pub use proxy::*;
