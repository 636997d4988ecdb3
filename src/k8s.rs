//! Kubernetes implementations of the cluster API operations.

pub mod client;
pub mod drain;
pub mod lock_object;
pub mod node;

pub use client::build_client;
pub use drain::KubeDrainer;
pub use lock_object::KubeLockObject;
pub use node::KubeNode;
