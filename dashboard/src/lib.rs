pub mod client;
pub mod server;
pub mod session;
pub mod store;

pub use client::{ClientError, NodeApi, ParamClient};
pub use session::{NodeSession, ParamKind, SessionError, SessionHandle, SessionStatus};
