pub mod error;
pub mod event;
pub mod message;
pub mod sandbox;
pub mod session;

pub use error::*;
pub use event::*;
pub use message::*;
pub use sandbox::*;
pub use session::*;
