use std::net::SocketAddr;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("failed to bind discovery socket: {0}")]
    DiscoveryBind(std::io::Error),

    #[error("{0} is not a multicast address")]
    NotMulticast(SocketAddr),

    #[error("malformed endpoint {0:?}")]
    MalformedEndpoint(String),

    #[error("no usable network interface with an IPv4 address")]
    NoExternalIp,

    #[error("no multicast-capable interface found")]
    NoMulticastInterface,

    #[error("no worker available")]
    NoWorkerAvailable,

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("system probe error: {0}")]
    Probe(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PoolError>;
