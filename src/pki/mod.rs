pub mod generator;
pub mod keys;
pub mod nodeid;

pub use generator::{generate_key, generate_keys, CancelToken};
pub use keys::{ec_public_key_point, PrivateKey, CURVE_PRIME_BYTES};
pub use nodeid::{NodeId, NODE_ID_LENGTH};
