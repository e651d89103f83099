mod shutdown;

pub mod config;
pub mod modbus;
pub mod poll;
pub mod server;

mod error;
pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;
