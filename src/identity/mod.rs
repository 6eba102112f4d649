pub mod ca;

pub use ca::{new_ca, FullCertificateAuthority, NewCaOptions};

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use x509_parser::certificate::X509Certificate;

use crate::peertls::{
    self, Certificate, Error, PeerCertVerifier, VerifyPeerCertChains, CA_INDEX,
};
use crate::pki::{NodeId, PrivateKey};

/// Another peer on the network: its presented chain and the node ID derived
/// from the CA public key. Read-only after construction.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerIdentity {
    /// Intermediates above the CA, up to a self-signed root.
    pub rest_chain: Vec<Certificate>,
    /// The peer's self-signed (or nested) CA.
    pub ca: Certificate,
    /// The end-entity certificate used on the wire, signed by the CA.
    pub leaf: Certificate,
    /// Derived from the CA public key.
    pub id: NodeId,
}

impl PeerIdentity {
    pub fn from_chain(
        leaf: Certificate,
        ca: Certificate,
        rest_chain: Vec<Certificate>,
    ) -> Result<Self, Error> {
        let id = ca.node_id()?;
        Ok(Self {
            rest_chain,
            ca,
            leaf,
            id,
        })
    }

    /// Builds a peer identity from the raw DER chain a TLS handshake
    /// presented. At least a leaf and a CA are required.
    pub fn from_raw_chain(raw_chain: &[Vec<u8>]) -> Result<Self, Error> {
        if raw_chain.len() < CA_INDEX + 1 {
            return Err(Error::ChainLength);
        }
        let mut certs = raw_chain
            .iter()
            .map(|der| Certificate::from_der(der.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        let rest = certs.split_off(CA_INDEX + 1);
        let ca = certs.pop().ok_or(Error::ChainLength)?;
        let leaf = certs.pop().ok_or(Error::ChainLength)?;
        Self::from_chain(leaf, ca, rest)
    }
}

/// This node on the network: a peer identity plus the leaf private key used
/// for TLS sessions and signing.
#[derive(Debug)]
pub struct FullIdentity {
    pub rest_chain: Vec<Certificate>,
    pub ca: Certificate,
    pub leaf: Certificate,
    pub id: NodeId,
    pub key: PrivateKey,
}

impl FullIdentity {
    /// Loads a full identity from PEM-encoded chain and key bytes.
    pub fn from_pem(chain_pem: &[u8], key_pem: &str) -> Result<Self, Error> {
        let mut chain = peertls::chain_from_pem(chain_pem)?;
        if chain.len() < CA_INDEX + 1 {
            return Err(Error::ChainLength);
        }
        let key = PrivateKey::from_pem(key_pem)?;

        let rest_chain = chain.split_off(CA_INDEX + 1);
        let ca = chain.pop().ok_or(Error::ChainLength)?;
        let leaf = chain.pop().ok_or(Error::ChainLength)?;
        let id = ca.node_id()?;

        Ok(Self {
            rest_chain,
            ca,
            leaf,
            id,
            key,
        })
    }

    /// Reads the identity from its configured cert and key paths.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, Error> {
        let chain_pem = fs::read(cert_path).map_err(not_exist)?;
        let key_pem = fs::read_to_string(key_path).map_err(not_exist)?;
        Self::from_pem(&chain_pem, &key_pem)
    }

    /// Writes the chain (with detached extension blocks) and the private
    /// key as PEM files.
    pub fn save(&self, cert_path: &Path, key_path: &Path) -> Result<(), Error> {
        fs::write(cert_path, peertls::chain_to_pem(&self.chain())?)?;
        fs::write(key_path, self.key.to_pem())?;
        Ok(())
    }

    /// The full chain, leaf first.
    pub fn chain(&self) -> Vec<Certificate> {
        let mut chain = vec![self.leaf.clone(), self.ca.clone()];
        chain.extend(self.rest_chain.iter().cloned());
        chain
    }

    /// The DER chain exactly as it appears on the TLS wire.
    pub fn chain_raw(&self) -> Vec<Vec<u8>> {
        self.chain().iter().map(|c| c.der().to_vec()).collect()
    }

    pub fn rest_chain_raw(&self) -> Vec<Vec<u8>> {
        self.rest_chain.iter().map(|c| c.der().to_vec()).collect()
    }

    pub fn peer(&self) -> PeerIdentity {
        PeerIdentity {
            rest_chain: self.rest_chain.clone(),
            ca: self.ca.clone(),
            leaf: self.leaf.clone(),
            id: self.id,
        }
    }
}

fn not_exist(err: std::io::Error) -> Error {
    if err.kind() == ErrorKind::NotFound {
        Error::NotExist(err)
    } else {
        Error::Io(err)
    }
}

/// Node ID of a PEM-encoded identity chain (`[leaf, ca, rest...]`).
///
/// Only identity-shaped chains are accepted: anything without a CA at
/// index 1 is rejected with `ChainLength`. For a CA's own chain file use
/// [`ca_node_id_from_pem`].
pub fn node_id_from_pem(pem_bytes: &[u8]) -> Result<NodeId, Error> {
    let chain = peertls::chain_from_pem(pem_bytes)?;
    if chain.len() < CA_INDEX + 1 {
        return Err(Error::ChainLength);
    }
    chain[CA_INDEX].node_id()
}

/// Node ID of a PEM-encoded CA chain (`[ca, rest...]`).
///
/// The first certificate is the CA itself; any following certificates are
/// its parents, whose IDs are not this node's.
pub fn ca_node_id_from_pem(pem_bytes: &[u8]) -> Result<NodeId, Error> {
    let chain = peertls::chain_from_pem(pem_bytes)?;
    chain.first().ok_or(Error::ChainLength)?.node_id()
}

/// Recomputes the peer's node ID from its CA certificate and compares it to
/// the expected one. The all-zero ID skips the check (opportunistic mode).
pub struct VerifyIdentity {
    expected: NodeId,
}

impl VerifyIdentity {
    pub fn new(expected: NodeId) -> Self {
        Self { expected }
    }
}

impl PeerCertVerifier for VerifyIdentity {
    fn verify(
        &self,
        _raw_chain: &[Vec<u8>],
        parsed_chains: &[Vec<X509Certificate<'_>>],
    ) -> Result<(), Error> {
        if self.expected == NodeId::ZERO {
            return Ok(());
        }
        let chain = &parsed_chains[0];
        if chain.len() < CA_INDEX + 1 {
            return Err(Error::ChainLength);
        }
        let actual = NodeId::from_public_key_der(chain[CA_INDEX].public_key().raw)?;
        if actual != self.expected {
            return Err(Error::IdentityMismatch {
                expected: self.expected,
                actual,
            });
        }
        Ok(())
    }
}

/// Verifier list for an accepting endpoint: chain signatures first, then
/// whatever the caller composed (whitelist, revocation, ...).
pub fn server_verifiers(
    user: Vec<Option<Box<dyn PeerCertVerifier>>>,
) -> Vec<Option<Box<dyn PeerCertVerifier>>> {
    let mut verifiers: Vec<Option<Box<dyn PeerCertVerifier>>> =
        vec![Some(Box::new(VerifyPeerCertChains))];
    verifiers.extend(user);
    verifiers
}

/// Verifier list for a dialing endpoint: chain signatures plus the identity
/// binding for the node being dialed.
pub fn dial_verifiers(expected: NodeId) -> Vec<Option<Box<dyn PeerCertVerifier>>> {
    vec![
        Some(Box::new(VerifyPeerCertChains)),
        Some(Box::new(VerifyIdentity::new(expected))),
    ]
}
