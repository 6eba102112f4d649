use asn1_rs::{oid, Oid};
use ring::signature::{self, UnparsedPublicKey};
use x509_parser::certificate::X509Certificate;

use super::{Certificate, Error, CA_INDEX};

const ECDSA_WITH_SHA256: Oid<'static> = oid!(1.2.840.10045.4.3.2);

/// One stage of the peer-certificate verification pipeline.
///
/// `raw_chain` holds the DER blobs exactly as presented on the wire;
/// `parsed_chains` carries the parsed chain in slot 0. The slice shape
/// leaves room for a future multi-chain extension.
pub trait PeerCertVerifier: Send + Sync {
    fn verify(
        &self,
        raw_chain: &[Vec<u8>],
        parsed_chains: &[Vec<X509Certificate<'_>>],
    ) -> Result<(), Error>;
}

/// Parses the presented chain and runs every verifier in order, skipping
/// `None` entries. Any failure aborts the handshake wrapped under
/// `Error::VerifyPeerCert`.
pub fn verify_peer(
    raw_chain: &[Vec<u8>],
    verifiers: &[Option<Box<dyn PeerCertVerifier>>],
) -> Result<(), Error> {
    let mut parsed = Vec::with_capacity(raw_chain.len());
    for der in raw_chain {
        let (_, cert) = x509_parser::parse_x509_certificate(der)
            .map_err(|e| Error::VerifyPeerCert(Box::new(Error::Parse(e.to_string()))))?;
        parsed.push(cert);
    }
    let chains = [parsed];

    for verifier in verifiers.iter().flatten() {
        verifier
            .verify(raw_chain, &chains)
            .map_err(|e| Error::VerifyPeerCert(Box::new(e)))?;
    }
    Ok(())
}

/// Verifies `child`'s signature using `parent`'s public key, honoring the
/// signature algorithm the child declares. Only ecdsa-with-SHA256 is used
/// on this network.
pub(crate) fn verify_cert_signature(
    parent: &X509Certificate<'_>,
    child: &X509Certificate<'_>,
) -> Result<(), Error> {
    if child.signature_algorithm.algorithm != ECDSA_WITH_SHA256 {
        return Err(Error::UnsupportedKey(format!(
            "unsupported signature algorithm {}",
            child.signature_algorithm.algorithm
        )));
    }

    UnparsedPublicKey::new(
        &signature::ECDSA_P256_SHA256_ASN1,
        parent.public_key().subject_public_key.data.as_ref(),
    )
    .verify(
        child.tbs_certificate.as_ref(),
        child.signature_value.data.as_ref(),
    )
    .map_err(|_| {
        Error::VerifyCertificateChain("certificate not signed by claimed issuer".to_string())
    })
}

/// Asserts that every certificate in the chain is signed by its successor
/// and that the final certificate is self-signed.
pub struct VerifyPeerCertChains;

impl PeerCertVerifier for VerifyPeerCertChains {
    fn verify(
        &self,
        _raw_chain: &[Vec<u8>],
        parsed_chains: &[Vec<X509Certificate<'_>>],
    ) -> Result<(), Error> {
        let chain = &parsed_chains[0];
        if chain.len() < CA_INDEX + 1 {
            return Err(Error::ChainLength);
        }

        for i in 1..chain.len() {
            verify_cert_signature(&chain[i], &chain[i - 1])?;
        }

        let root = &chain[chain.len() - 1];
        if root.issuer() != root.subject() {
            return Err(Error::VerifyCertificateChain(
                "root certificate is not self-signed".to_string(),
            ));
        }
        verify_cert_signature(root, root)
    }
}

/// Passes when any whitelisted CA verifies the signature on the peer's CA
/// certificate. An empty whitelist yields no verifier at all.
pub struct VerifyCaWhitelist {
    cas: Vec<Certificate>,
}

impl VerifyCaWhitelist {
    pub fn new(cas: Vec<Certificate>) -> Option<Box<dyn PeerCertVerifier>> {
        if cas.is_empty() {
            None
        } else {
            Some(Box::new(Self { cas }))
        }
    }
}

impl PeerCertVerifier for VerifyCaWhitelist {
    fn verify(
        &self,
        _raw_chain: &[Vec<u8>],
        parsed_chains: &[Vec<X509Certificate<'_>>],
    ) -> Result<(), Error> {
        let chain = &parsed_chains[0];
        if chain.len() < CA_INDEX + 1 {
            return Err(Error::ChainLength);
        }
        for ca in &self.cas {
            let parsed = ca.parse()?;
            if verify_cert_signature(&parsed, &chain[CA_INDEX]).is_ok() {
                return Ok(());
            }
        }
        Err(Error::VerifyCaWhitelist)
    }
}
