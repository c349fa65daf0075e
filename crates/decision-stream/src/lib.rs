pub mod client;
pub mod error;
pub mod transport;

pub use client::{StreamClient, StreamState};
pub use error::{error_chain, StreamError};
pub use transport::{AuthMode, AuthTransport};
