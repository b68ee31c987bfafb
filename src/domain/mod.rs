pub mod event;
pub mod provider;
pub mod request;

pub use event::*;
pub use provider::*;
pub use request::*;
