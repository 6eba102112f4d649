use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use rcgen::CertificateParams;
use tracing::{debug, info};

use super::FullIdentity;
use crate::peertls::{self, Certificate, Error};
use crate::pki::{generate_keys, CancelToken, NodeId, PrivateKey};

/// Candidates below this difficulty never reach the CA callback; the
/// user-configured floor is enforced on top of it.
const MINIMUM_LOGGABLE_DIFFICULTY: u16 = 8;

/// The CA which authors and validates full identities: its certificate, the
/// chain above it, the node ID bound to its public key, and its private key.
#[derive(Debug)]
pub struct FullCertificateAuthority {
    /// Certificates above this CA, up to a self-signed root. Empty for a
    /// self-signed CA.
    pub rest_chain: Vec<Certificate>,
    pub cert: Certificate,
    pub id: NodeId,
    pub key: PrivateKey,
}

/// Parameters for `new_ca`.
pub struct NewCaOptions {
    /// Minimum number of trailing zero bits the node ID must have.
    pub difficulty: u16,
    /// Number of proof-of-work worker threads.
    pub concurrency: usize,
    /// Optional parent authority; when set the new CA is signed by it and
    /// carries it as rest chain.
    pub parent: Option<(Certificate, PrivateKey)>,
}

/// Mines a key whose node ID meets the difficulty floor, then builds the CA
/// certificate around it (self-signed, or signed by the parent).
///
/// The first key to meet the floor wins; later winners are discarded. Worker
/// errors abort the whole operation, and cancelling `cancel` surfaces
/// `Error::Cancelled`.
pub fn new_ca(cancel: &CancelToken, opts: NewCaOptions) -> Result<FullCertificateAuthority, Error> {
    let concurrency = opts.concurrency.max(1);
    info!(
        difficulty = opts.difficulty,
        concurrency, "generating certificate authority key"
    );

    let highscore = AtomicU32::new(0);
    let attempts = AtomicU32::new(0);
    let selected: Mutex<Option<(PrivateKey, NodeId)>> = Mutex::new(None);

    generate_keys(
        cancel,
        MINIMUM_LOGGABLE_DIFFICULTY,
        concurrency,
        |key, id| {
            let count = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            if count % 100 == 0 {
                debug!(
                    count,
                    highscore = highscore.load(Ordering::Relaxed),
                    "still searching"
                );
            }

            let difficulty = id.difficulty();
            if difficulty >= opts.difficulty {
                let mut slot = selected
                    .lock()
                    .map_err(|_| Error::Generate("selected key slot poisoned".to_string()))?;
                if slot.is_none() {
                    *slot = Some((key, id));
                }
                drop(slot);

                highscore.fetch_max(u32::from(difficulty), Ordering::Relaxed);
                info!(difficulty, node_id = %id, "found key meeting the difficulty floor");
                return Ok(true);
            }

            let previous = highscore.fetch_max(u32::from(difficulty), Ordering::Relaxed);
            if u32::from(difficulty) > previous {
                debug!(difficulty, "new best difficulty");
            }
            Ok(false)
        },
    )?;

    let (key, id) = selected
        .into_inner()
        .map_err(|_| Error::Generate("selected key slot poisoned".to_string()))?
        .ok_or_else(|| Error::Generate("no key was selected".to_string()))?;

    let template = peertls::ca_template()?;
    let cert = peertls::new_cert(
        &key,
        opts.parent.as_ref().map(|(cert, key)| (cert, key)),
        template,
    )?;
    let rest_chain = opts.parent.map(|(cert, _)| vec![cert]).unwrap_or_default();

    Ok(FullCertificateAuthority {
        rest_chain,
        cert,
        id,
        key,
    })
}

impl FullCertificateAuthority {
    /// Issues a fresh leaf identity under this CA. When the CA is nested,
    /// the leaf additionally carries the CA's detached signature over its
    /// raw bytes.
    pub fn new_identity(&self) -> Result<FullIdentity, Error> {
        let template = peertls::leaf_template()?;
        let leaf_key = PrivateKey::generate()?;
        let mut leaf = peertls::new_cert(&leaf_key, Some((&self.cert, &self.key)), template)?;

        if !self.rest_chain.is_empty() {
            peertls::add_signed_cert_ext(&self.key, &mut leaf)?;
        }

        Ok(FullIdentity {
            rest_chain: self.rest_chain.clone(),
            ca: self.cert.clone(),
            leaf,
            id: self.id,
            key: leaf_key,
        })
    }

    /// Signs an arbitrary template with the CA key, placing `key`'s public
    /// key in the resulting certificate.
    pub fn sign(&self, template: CertificateParams, key: &PrivateKey) -> Result<Certificate, Error> {
        peertls::new_cert(key, Some((&self.cert, &self.key)), template)
    }

    /// The CA chain, CA first.
    pub fn chain(&self) -> Vec<Certificate> {
        let mut chain = vec![self.cert.clone()];
        chain.extend(self.rest_chain.iter().cloned());
        chain
    }

    pub fn rest_chain_raw(&self) -> Vec<Vec<u8>> {
        self.rest_chain.iter().map(|c| c.der().to_vec()).collect()
    }

    /// Writes the CA chain and private key as PEM files.
    pub fn save(&self, cert_path: &Path, key_path: &Path) -> Result<(), Error> {
        fs::write(cert_path, peertls::chain_to_pem(&self.chain())?)?;
        fs::write(key_path, self.key.to_pem())?;
        Ok(())
    }

    /// Loads a CA from its chain and key files.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, Error> {
        let chain_pem = fs::read(cert_path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::NotExist(e),
            _ => Error::Io(e),
        })?;
        let key_pem = fs::read_to_string(key_path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::NotExist(e),
            _ => Error::Io(e),
        })?;

        let mut chain = peertls::chain_from_pem(&chain_pem)?;
        if chain.is_empty() {
            return Err(Error::ChainLength);
        }
        let rest_chain = chain.split_off(1);
        let cert = chain.pop().ok_or(Error::ChainLength)?;
        let id = cert.node_id()?;
        let key = PrivateKey::from_pem(&key_pem)?;

        Ok(Self {
            rest_chain,
            cert,
            id,
            key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peertls::{
        verify_peer, verify_signed_cert_ext, PeerCertVerifier, VerifyPeerCertChains,
    };

    fn mine_ca(difficulty: u16, concurrency: usize) -> FullCertificateAuthority {
        let cancel = CancelToken::new();
        new_ca(
            &cancel,
            NewCaOptions {
                difficulty,
                concurrency,
                parent: None,
            },
        )
        .unwrap()
    }

    fn chain_verifiers() -> Vec<Option<Box<dyn PeerCertVerifier>>> {
        vec![Some(Box::new(VerifyPeerCertChains))]
    }

    #[test]
    fn test_new_ca_meets_difficulty() {
        let ca = mine_ca(8, 1);
        assert!(ca.id.difficulty() >= 8);
        assert_eq!(ca.id, ca.cert.node_id().unwrap());
        assert!(ca.rest_chain.is_empty());
    }

    #[test]
    fn test_new_ca_concurrent() {
        let ca = mine_ca(8, 4);
        assert!(ca.id.difficulty() >= 8);
    }

    #[test]
    fn test_new_ca_cancelled() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = new_ca(
            &cancel,
            NewCaOptions {
                difficulty: 8,
                concurrency: 1,
                parent: None,
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_ca_pem_round_trip() {
        let ca = mine_ca(8, 1);
        let dir = std::env::temp_dir();
        let cert_path = dir.join("gridnode_ca_roundtrip.cert");
        let key_path = dir.join("gridnode_ca_roundtrip.key");

        ca.save(&cert_path, &key_path).unwrap();
        let reloaded = FullCertificateAuthority::load(&cert_path, &key_path).unwrap();
        let _ = std::fs::remove_file(&cert_path);
        let _ = std::fs::remove_file(&key_path);

        assert_eq!(ca.id, reloaded.id);
        assert_eq!(ca.cert, reloaded.cert);
        assert_eq!(ca.rest_chain, reloaded.rest_chain);
    }

    #[test]
    fn test_new_identity_chain_verifies() {
        let ca = mine_ca(8, 1);
        let identity = ca.new_identity().unwrap();

        assert_eq!(identity.id, ca.id);
        assert!(identity.leaf.extra_extensions().is_empty());
        verify_peer(&identity.chain_raw(), &chain_verifiers()).unwrap();
    }

    #[test]
    fn test_nested_ca_leaf_carries_signed_cert_ext() {
        let parent = mine_ca(8, 2);
        let cancel = CancelToken::new();
        let child = new_ca(
            &cancel,
            NewCaOptions {
                difficulty: 8,
                concurrency: 2,
                parent: Some((parent.cert.clone(), parent.key)),
            },
        )
        .unwrap();

        assert_eq!(child.rest_chain, vec![parent.cert.clone()]);

        let identity = ca_identity_with_ext(&child);
        assert_eq!(identity.rest_chain, child.rest_chain);
        verify_signed_cert_ext(&child.cert, &identity.leaf).unwrap();

        // Full three-cert chain still verifies leaf -> CA -> root.
        verify_peer(&identity.chain_raw(), &chain_verifiers()).unwrap();
    }

    fn ca_identity_with_ext(ca: &FullCertificateAuthority) -> FullIdentity {
        let identity = ca.new_identity().unwrap();
        assert_eq!(identity.leaf.extra_extensions().len(), 1);
        identity
    }
}
