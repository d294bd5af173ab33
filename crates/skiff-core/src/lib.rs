pub mod actor;
pub mod config;
pub mod error;
pub mod registry;
pub mod request;
pub mod store;
pub mod usage;


pub use actor::{ActorDeps, PathContent, SessionActor, TurnStream};
pub use config::{ConfigStore, SkiffConfig};
pub use error::{Result, SessionError};
pub use registry::SessionRegistry;
pub use request::{FilePathRequest, InitializeRequest, SendMessageRequest};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore, StoreError};
pub use usage::{LogUsageSink, NoopUsageSink, UsageEvent, UsageSink};
