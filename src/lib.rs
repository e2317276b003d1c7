pub mod auth;
pub mod cgroup;
pub mod config;
pub mod error;
pub mod grpc;
pub mod limits;
pub mod logstore;
pub mod registry;
pub mod shutdown;
pub mod supervisor;
pub mod tls;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("procwarden");
}
