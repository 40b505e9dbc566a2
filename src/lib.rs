pub mod config;
pub mod error;
pub mod scheduler;
pub mod shutdown;
pub mod transport;
pub mod worker;

pub use error::{Result, TransportError};
pub use transport::Transport;
