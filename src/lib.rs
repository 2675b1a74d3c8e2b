pub mod record;
pub mod locator;
pub mod transform;
pub mod transport;
pub mod repository;
pub mod error_handler;
pub mod dispatch;
pub mod appender;
pub mod layer;

pub mod init;
pub mod env;
pub mod noop_transport;

pub use appender::{ActivationError, AppenderConfig, ElasticAppender};
pub use dispatch::DispatchCoordinator;
pub use locator::{ConfigError, TargetLocator};
pub use record::LogEvent;
pub use transport::{HttpTransport, Transport, TransportError};
