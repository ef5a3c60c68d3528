//! Ethernet datapath: descriptors, offload, per-queue-pair processing, and
//! the weighted round-robin scheduler across queue pairs.

pub mod descriptor;
pub mod offload;
pub mod queue_manager;
pub mod queue_pair;
