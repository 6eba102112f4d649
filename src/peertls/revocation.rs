use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use ring::signature::{self, UnparsedPublicKey};
use x509_parser::certificate::X509Certificate;

use super::verify::PeerCertVerifier;
use super::{Error, CA_INDEX, LEAF_INDEX};
use crate::pki::PrivateKey;

/// A CA-signed assertion that a certificate has been revoked.
///
/// `cert_hash` holds the raw DER of the revoked certificate; `signature` is
/// the CA's fixed-width ECDSA signature over those bytes.
#[derive(Clone, Debug, PartialEq)]
pub struct RevocationRecord {
    pub cert_hash: Vec<u8>,
    pub signature: Vec<u8>,
    pub timestamp: i64,
}

impl RevocationRecord {
    /// Creates a record revoking `cert_der`, signed with the CA key.
    pub fn sign(ca_key: &PrivateKey, cert_der: &[u8], timestamp: i64) -> Result<Self, Error> {
        Ok(Self {
            cert_hash: cert_der.to_vec(),
            signature: ca_key.sign_fixed(cert_der)?,
            timestamp,
        })
    }

    /// Verifies the record's signature against the CA certificate that
    /// allegedly issued it.
    pub fn verify(&self, ca: &X509Certificate<'_>) -> Result<(), Error> {
        UnparsedPublicKey::new(
            &signature::ECDSA_P256_SHA256_FIXED,
            ca.public_key().subject_public_key.data.as_ref(),
        )
        .verify(&self.cert_hash, &self.signature)
        .map_err(|_| Error::Extension("revocation record signature invalid".to_string()))
    }
}

/// Store of revocation records keyed by the CA's raw certificate bytes.
/// Implementations must be safe under concurrent callers.
pub trait RevocationStore: Send + Sync {
    /// Returns the most recent record for the chain's CA, if any.
    fn get(&self, chain: &[Vec<u8>]) -> Result<Option<RevocationRecord>, Error>;
}

/// In-memory revocation store.
#[derive(Default)]
pub struct MemoryRevocationStore {
    records: RwLock<HashMap<Vec<u8>, Vec<RevocationRecord>>>,
}

impl MemoryRevocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, ca_der: &[u8], record: RevocationRecord) -> Result<(), Error> {
        let mut records = self
            .records
            .write()
            .map_err(|_| Error::Extension("revocation store lock poisoned".to_string()))?;
        records.entry(ca_der.to_vec()).or_default().push(record);
        Ok(())
    }
}

impl RevocationStore for MemoryRevocationStore {
    fn get(&self, chain: &[Vec<u8>]) -> Result<Option<RevocationRecord>, Error> {
        let ca = chain.get(CA_INDEX).ok_or(Error::ChainLength)?;
        let records = self
            .records
            .read()
            .map_err(|_| Error::Extension("revocation store lock poisoned".to_string()))?;
        Ok(records
            .get(ca.as_slice())
            .and_then(|rs| rs.iter().max_by_key(|r| r.timestamp))
            .cloned())
    }
}

/// Pipeline verifier rejecting chains whose CA or leaf has a live
/// revocation record.
pub struct VerifyUnrevokedChain {
    store: Arc<dyn RevocationStore>,
}

impl VerifyUnrevokedChain {
    pub fn new(store: Arc<dyn RevocationStore>) -> Option<Box<dyn PeerCertVerifier>> {
        Some(Box::new(Self { store }))
    }
}

impl PeerCertVerifier for VerifyUnrevokedChain {
    fn verify(
        &self,
        raw_chain: &[Vec<u8>],
        parsed_chains: &[Vec<X509Certificate<'_>>],
    ) -> Result<(), Error> {
        if raw_chain.len() < CA_INDEX + 1 {
            return Err(Error::ChainLength);
        }

        let record = match self
            .store
            .get(raw_chain)
            .map_err(|e| Error::Extension(e.to_string()))?
        {
            None => return Ok(()),
            Some(record) => record,
        };

        if record.cert_hash == raw_chain[CA_INDEX] || record.cert_hash == raw_chain[LEAF_INDEX] {
            record.verify(&parsed_chains[0][CA_INDEX])?;
            return Err(Error::RevokedCert);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peertls::verify::{verify_peer, VerifyPeerCertChains};
    use crate::peertls::{ca_template, leaf_template, new_cert, Certificate};

    struct TestIdentity {
        ca_key: PrivateKey,
        ca: Certificate,
        raw_chain: Vec<Vec<u8>>,
    }

    fn test_identity() -> TestIdentity {
        let ca_key = PrivateKey::generate().unwrap();
        let ca = new_cert(&ca_key, None, ca_template().unwrap()).unwrap();
        let leaf_key = PrivateKey::generate().unwrap();
        let leaf = new_cert(&leaf_key, Some((&ca, &ca_key)), leaf_template().unwrap()).unwrap();
        let raw_chain = vec![leaf.der().to_vec(), ca.der().to_vec()];
        TestIdentity { ca_key, ca, raw_chain }
    }

    fn handshake(store: Arc<dyn RevocationStore>, raw: &[Vec<u8>]) -> Result<(), Error> {
        let verifiers = vec![
            Some(Box::new(VerifyPeerCertChains) as Box<dyn PeerCertVerifier>),
            VerifyUnrevokedChain::new(store),
        ];
        verify_peer(raw, &verifiers)
    }

    #[test]
    fn test_no_record_passes() {
        let identity = test_identity();
        let store = Arc::new(MemoryRevocationStore::new());
        handshake(store, &identity.raw_chain).unwrap();
    }

    #[test]
    fn test_revoked_leaf_rejected() {
        let identity = test_identity();
        let store = Arc::new(MemoryRevocationStore::new());

        let record =
            RevocationRecord::sign(&identity.ca_key, &identity.raw_chain[LEAF_INDEX], 1).unwrap();
        store.put(identity.ca.der(), record).unwrap();

        let err = handshake(store, &identity.raw_chain).unwrap_err();
        match err {
            Error::VerifyPeerCert(inner) => assert!(matches!(*inner, Error::RevokedCert)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_revoked_ca_rejected() {
        let identity = test_identity();
        let store = Arc::new(MemoryRevocationStore::new());

        let record =
            RevocationRecord::sign(&identity.ca_key, &identity.raw_chain[CA_INDEX], 1).unwrap();
        store.put(identity.ca.der(), record).unwrap();

        let err = handshake(store, &identity.raw_chain).unwrap_err();
        match err {
            Error::VerifyPeerCert(inner) => assert!(matches!(*inner, Error::RevokedCert)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_forged_record_is_extension_error() {
        let identity = test_identity();
        let forger = test_identity();
        let store = Arc::new(MemoryRevocationStore::new());

        // Signed by the wrong CA key: present but invalid.
        let record =
            RevocationRecord::sign(&forger.ca_key, &identity.raw_chain[LEAF_INDEX], 1).unwrap();
        store.put(identity.ca.der(), record).unwrap();

        let err = handshake(store, &identity.raw_chain).unwrap_err();
        match err {
            Error::VerifyPeerCert(inner) => assert!(matches!(*inner, Error::Extension(_))),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_record_for_other_cert_passes() {
        let identity = test_identity();
        let bystander = test_identity();
        let store = Arc::new(MemoryRevocationStore::new());

        let record =
            RevocationRecord::sign(&identity.ca_key, &bystander.raw_chain[LEAF_INDEX], 1).unwrap();
        store.put(identity.ca.der(), record).unwrap();

        handshake(store, &identity.raw_chain).unwrap();
    }

    #[test]
    fn test_latest_record_wins() {
        let identity = test_identity();
        let store = MemoryRevocationStore::new();

        let early =
            RevocationRecord::sign(&identity.ca_key, &identity.raw_chain[LEAF_INDEX], 1).unwrap();
        let late =
            RevocationRecord::sign(&identity.ca_key, &identity.raw_chain[CA_INDEX], 2).unwrap();
        store.put(identity.ca.der(), early).unwrap();
        store.put(identity.ca.der(), late.clone()).unwrap();

        let fetched = store.get(&identity.raw_chain).unwrap().unwrap();
        assert_eq!(fetched, late);
    }
}
