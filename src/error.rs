use thiserror::Error;

/// Named failure kinds a worker can hit while driving one connection.
///
/// `CacheCorruption` and a listen-socket failure at startup are not
/// represented here: both are unrecoverable invariant violations and
/// terminate the process directly rather than propagating as a `Result`.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("unsupported method in client request")]
    ClientProtocol,

    #[error("malformed host in client request")]
    MalformedHost,

    #[error("DNS lookup failed for {hostname}")]
    OriginDns { hostname: String },

    #[error("failed to connect to origin {hostname}:{port}: {source}")]
    OriginConnect {
        hostname: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

pub type ProxyResult<T> = Result<T, ProxyError>;
