pub mod messages;

pub use messages::{
    AgreementsSummary, PayerBandwidthAllocation, RenterBandwidthAllocation, Status,
};

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use ring::signature::{self, UnparsedPublicKey};
use thiserror::Error as ThisError;
use tracing::debug;

use crate::identity::PeerIdentity;
use crate::pki::{ec_public_key_point, NodeId, CURVE_PRIME_BYTES};

/// Outer error class of the agreement receiver: who the failure is
/// attributed to.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The caller's TLS identity is missing or does not match the claim.
    #[error("bad peer identity: {0}")]
    BadId(String),

    /// The payer (satellite) side of the allocation is unacceptable.
    #[error("payer allocation rejected: {0}")]
    Payer(#[source] Cause),

    /// The renter (uplink) side of the allocation is unacceptable.
    #[error("renter allocation rejected: {0}")]
    Renter(#[source] Cause),
}

/// Inner cause carried by the outer error class.
#[derive(Debug, ThisError)]
pub enum Cause {
    #[error("missing payer allocation")]
    MissingPayerAllocation,

    #[error("satellite ID mismatch: {got} vs {want}")]
    SatelliteMismatch { got: String, want: String },

    #[error("allocation expired: {expired} vs {now}")]
    Expired { expired: i64, now: i64 },

    #[error("signature too short: {got} vs {want}")]
    SigLen { got: usize, want: usize },

    #[error("signature verification failed")]
    Verify,

    #[error("unsupported public key: {0}")]
    UnsupportedKey(String),

    /// The agreement serial was already persisted.
    #[error("duplicate agreement serial")]
    Serial(#[source] StoreError),

    #[error("agreement store failure")]
    Store(#[source] StoreError),
}

impl Error {
    /// The reply status a transport should send alongside this error. Only
    /// a non-conflict store failure is reported as `FAIL`; everything else
    /// rejects the request outright.
    pub fn status(&self) -> Status {
        match self {
            Error::Payer(Cause::Store(_)) => Status::Fail,
            _ => Status::Rejected,
        }
    }
}

/// Typed store failures. Implementations classify unique-constraint
/// violations themselves instead of leaking engine-specific error text.
#[derive(Debug, ThisError)]
pub enum StoreError {
    #[error("unique constraint violation")]
    UniqueViolation,

    #[error("record not found")]
    NotFound,

    #[error("{0}")]
    Other(String),
}

/// Persists accepted bandwidth agreements.
#[async_trait]
pub trait AgreementStore: Send + Sync {
    async fn create_agreement(&self, rba: &RenterBandwidthAllocation) -> Result<(), StoreError>;
}

/// Resolves a payer-registered uplink ID to its PKIX DER public key.
#[async_trait]
pub trait UplinkStore: Send + Sync {
    async fn get_public_key(&self, uplink_id: &[u8]) -> Result<Vec<u8>, StoreError>;
}

/// Receiver for doubly-signed bandwidth allocations.
///
/// `public_key` is the satellite's own PKIX DER public key, used to check
/// the payer signature on incoming allocations; `node_id` is the satellite's
/// identity that payer allocations must name.
pub struct Server {
    db: Arc<dyn AgreementStore>,
    uplinks: Arc<dyn UplinkStore>,
    public_key: Vec<u8>,
    node_id: NodeId,
}

impl Server {
    pub fn new(
        db: Arc<dyn AgreementStore>,
        uplinks: Arc<dyn UplinkStore>,
        public_key: Vec<u8>,
        node_id: NodeId,
    ) -> Self {
        Self {
            db,
            uplinks,
            public_key,
            node_id,
        }
    }

    /// Validates and persists a renter bandwidth allocation.
    ///
    /// `peer` is the caller's identity as extracted from the TLS session by
    /// the transport; `None` means the handshake produced no usable
    /// identity. On failure, `Error::status` tells the transport which
    /// reply status to send.
    pub async fn receive_agreement(
        &self,
        peer: Option<&PeerIdentity>,
        rba: &RenterBandwidthAllocation,
    ) -> Result<AgreementsSummary, Error> {
        debug!("received agreement");

        let pba = rba
            .payer_allocation
            .as_ref()
            .ok_or(Error::Payer(Cause::MissingPayerAllocation))?;

        let peer = peer.ok_or_else(|| Error::BadId("no peer identity on request".to_string()))?;
        if rba.storage_node_id != peer.id.as_bytes() {
            return Err(Error::BadId(format!(
                "storage node ID {} vs {}",
                hex::encode(&rba.storage_node_id),
                peer.id
            )));
        }

        if pba.satellite_id != self.node_id.as_bytes() {
            return Err(Error::Payer(Cause::SatelliteMismatch {
                got: hex::encode(&pba.satellite_id),
                want: self.node_id.to_string(),
            }));
        }

        let now = unix_now();
        if pba.expiration_unix_sec <= now {
            return Err(Error::Payer(Cause::Expired {
                expired: pba.expiration_unix_sec,
                now,
            }));
        }

        self.verify_signatures(rba, pba).await?;

        match self.db.create_agreement(rba).await {
            Ok(()) => {
                debug!("stored agreement");
                Ok(AgreementsSummary::with_status(Status::Ok))
            }
            Err(StoreError::UniqueViolation) => {
                Err(Error::Payer(Cause::Serial(StoreError::UniqueViolation)))
            }
            Err(err) => Err(Error::Payer(Cause::Store(err))),
        }
    }

    async fn verify_signatures(
        &self,
        rba: &RenterBandwidthAllocation,
        pba: &PayerBandwidthAllocation,
    ) -> Result<(), Error> {
        // Renter's (uplink) signature, against the key the payer registered.
        let uplink_key_der = self
            .uplinks
            .get_public_key(&pba.uplink_id)
            .await
            .map_err(|_| Error::Renter(Cause::Verify))?;
        let uplink_point = ec_public_key_point(&uplink_key_der)
            .map_err(|e| Error::Renter(Cause::UnsupportedKey(e.to_string())))?;

        if rba.signature.len() < CURVE_PRIME_BYTES {
            return Err(Error::Renter(Cause::SigLen {
                got: rba.signature.len(),
                want: CURVE_PRIME_BYTES,
            }));
        }
        verify_fixed(&uplink_point, &rba.signing_bytes(), &rba.signature)
            .map_err(|_| Error::Renter(Cause::Verify))?;

        // Payer's (satellite) signature, against our own key.
        let satellite_point = ec_public_key_point(&self.public_key)
            .map_err(|e| Error::Payer(Cause::UnsupportedKey(e.to_string())))?;

        if pba.signature.len() < CURVE_PRIME_BYTES {
            return Err(Error::Payer(Cause::SigLen {
                got: pba.signature.len(),
                want: CURVE_PRIME_BYTES,
            }));
        }
        verify_fixed(&satellite_point, &pba.signing_bytes(), &pba.signature)
            .map_err(|_| Error::Payer(Cause::Verify))?;

        Ok(())
    }
}

fn verify_fixed(public_key_point: &[u8], message: &[u8], sig: &[u8]) -> Result<(), ()> {
    UnparsedPublicKey::new(&signature::ECDSA_P256_SHA256_FIXED, public_key_point)
        .verify(message, sig)
        .map_err(|_| ())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
