use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HttpError {
    #[error("Invalid address {0}")]
    InvalidAddress(String),

    #[error("Failed to bind HTTP server to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}
