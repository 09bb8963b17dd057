pub mod auth;
pub mod bench;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod query;
pub mod wire_format;

pub use bench::{
    BufferSize,
    Fetch,
    BUFFER_SIZES,
};
pub use client::{
    BackendKey,
    Client,
    ClientOptions,
};
pub use config::PG_URL_ENV;
pub use connection::ConnectionOptions;
pub use error::{
    Error,
    Result,
    ServerError,
};
pub use protocol::TransactionStatus;
pub use query::{
    CommandTag,
    MultiResultReader,
    QueryResult,
    ResultReader,
    RowValues,
};
pub use wire_format::FieldDescription;
