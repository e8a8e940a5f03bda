pub mod client;
pub mod config;
pub mod dashboard;
pub mod discovery;
pub mod error;
pub mod net;
pub mod shutdown;
pub mod system;
pub mod worker;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("drover");
}
