//! Peer identity and mutual-TLS trust for a decentralized storage network.
//!
//! Every node derives its network address (node ID) from its CA public key
//! by double SHA-256, and pays a proof-of-work cost at identity creation:
//! the ID must carry a configurable number of trailing zero bits. Peers
//! authenticate each other with certificate chains rooted in self-signed
//! CAs, verified by a composable pipeline, and the bandwidth-agreement
//! service authorizes doubly-signed allocation messages against the TLS
//! peer identity.

pub mod bwagreement;
pub mod config;
pub mod identity;
pub mod peertls;
pub mod pki;
