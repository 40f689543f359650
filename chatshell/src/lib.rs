pub mod app;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod factory;
pub mod provider;
pub mod session;

pub use app::App;
pub use dispatch::Dispatcher;
pub use error::{ClientError, LlmError, SessionError};
pub use factory::ClientFactory;
pub use provider::{Client, ModelConfig, StreamResponse, StructuredResponse};
pub use session::{ChatSession, SessionManager, SessionStore};
