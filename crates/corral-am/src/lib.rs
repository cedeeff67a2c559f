//! The corral application master: deploys and supervises a `regiondb`
//! cluster (one master process plus N region servers) as a long-running
//! workload on a cluster resource manager, reconciling the observed
//! container population against the desired role counts.

pub mod appmaster;
pub mod cluster;
pub mod config;
pub mod description;
pub mod error;
pub mod id;
pub mod rpc;
pub mod supervisor;
