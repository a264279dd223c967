pub mod exit;
pub mod node;
pub mod request;

pub use exit::*;
pub use node::*;
pub use request::*;
