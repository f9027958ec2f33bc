pub mod connection;
pub mod operations;

pub use connection::{connect, create_ssl_connector};
pub use operations::PostgresTransport;
