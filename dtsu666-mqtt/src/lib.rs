pub mod config;
pub mod health;
pub mod homeassistant;
pub mod modbus;
pub mod mqtt;
pub mod sampler;
pub mod server;

mod error;
pub use error::{DecodeError, Error, PublishError, TransportError};

pub type Result<T> = std::result::Result<T, Error>;
