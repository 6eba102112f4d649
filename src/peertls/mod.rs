pub mod revocation;
pub mod verify;

pub use revocation::{MemoryRevocationStore, RevocationRecord, RevocationStore, VerifyUnrevokedChain};
pub use verify::{verify_peer, PeerCertVerifier, VerifyCaWhitelist, VerifyPeerCertChains};

use asn1_rs::{oid, FromDer, Oid, OctetString, Sequence, ToDer};
use pem::Pem;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyUsagePurpose, SerialNumber,
};
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{self, UnparsedPublicKey};
use rustls_pki_types::CertificateDer;
use thiserror::Error as ThisError;
use time::{Duration, OffsetDateTime};
use x509_parser::certificate::X509Certificate;

use crate::pki::{NodeId, PrivateKey};

/// Position of the end-entity certificate in a peer chain.
pub const LEAF_INDEX: usize = 0;
/// Position of the peer's CA certificate in a peer chain.
pub const CA_INDEX: usize = 1;

/// Private-arc OID under which a CA's signature over its leaf is carried
/// when the CA itself is nested under a parent.
pub const SIGNED_CERT_EXT_OID: Oid<'static> = oid!(1.3.6.1.4.1.99999.2);

const CERT_TAG: &str = "CERTIFICATE";
const EXTENSION_TAG: &str = "PKIX EXTENSION";
const ORGANIZATION: &str = "gridnode";
const VALIDITY_DAYS: i64 = 3650;

/// Errors produced by identity generation, certificate handling and the
/// peer verification pipeline.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Persisted identity file missing.
    #[error("file or directory not found: {0}")]
    NotExist(#[source] std::io::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Key or certificate generation failed.
    #[error("generation error: {0}")]
    Generate(String),

    /// Certificate template construction failed.
    #[error("template error: {0}")]
    Template(String),

    /// Wraps any pipeline failure surfaced to the TLS stack.
    #[error("peer certificate verification error: {0}")]
    VerifyPeerCert(#[source] Box<Error>),

    #[error("certificate chain signature verification failed: {0}")]
    VerifyCertificateChain(String),

    #[error("not signed by any CA in the whitelist")]
    VerifyCaWhitelist,

    #[error("peer ID did not match requested ID: {expected} vs {actual}")]
    IdentityMismatch { expected: NodeId, actual: NodeId },

    /// A live revocation record matches the presented chain.
    #[error("certificate revoked")]
    RevokedCert,

    /// A revocation record or extension is present but invalid.
    #[error("extension error: {0}")]
    Extension(String),

    #[error("unsupported key kind: {0}")]
    UnsupportedKey(String),

    /// A loaded chain has fewer than two certificates.
    #[error("identity chain does not contain a CA certificate")]
    ChainLength,

    #[error("certificate parse error: {0}")]
    Parse(String),

    #[error("PEM error: {0}")]
    Pem(#[from] pem::PemError),

    #[error("operation cancelled")]
    Cancelled,
}

/// An X.509 certificate in DER form together with any detached PKIX
/// extensions that travel with it in the PEM chain file.
#[derive(Clone, Debug, PartialEq)]
pub struct Certificate {
    der: Vec<u8>,
    extra_extensions: Vec<PkixExtension>,
}

impl Certificate {
    /// Wraps DER bytes, validating that they parse as an X.509 certificate.
    pub fn from_der(der: Vec<u8>) -> Result<Self, Error> {
        x509_parser::parse_x509_certificate(&der).map_err(|e| Error::Parse(e.to_string()))?;
        Ok(Self {
            der,
            extra_extensions: Vec::new(),
        })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn parse(&self) -> Result<X509Certificate<'_>, Error> {
        let (_, cert) =
            x509_parser::parse_x509_certificate(&self.der).map_err(|e| Error::Parse(e.to_string()))?;
        Ok(cert)
    }

    pub fn extra_extensions(&self) -> &[PkixExtension] {
        &self.extra_extensions
    }

    pub fn push_extension(&mut self, ext: PkixExtension) {
        self.extra_extensions.push(ext);
    }

    /// Node ID derived from this certificate's public key.
    pub fn node_id(&self) -> Result<NodeId, Error> {
        let parsed = self.parse()?;
        NodeId::from_public_key_der(parsed.public_key().raw)
    }
}

/// A detached extension: an opaque OID plus a DER value.
#[derive(Clone, Debug, PartialEq)]
pub struct PkixExtension {
    pub oid: Oid<'static>,
    pub value: Vec<u8>,
}

impl PkixExtension {
    /// Encodes the extension as `SEQUENCE { OID, OCTET STRING }`.
    pub fn to_der(&self) -> Result<Vec<u8>, Error> {
        let mut content = self
            .oid
            .to_der_vec()
            .map_err(|e| Error::Extension(e.to_string()))?;
        content.extend(
            OctetString::from(self.value.as_slice())
                .to_der_vec()
                .map_err(|e| Error::Extension(e.to_string()))?,
        );
        Sequence::new(content.into())
            .to_der_vec()
            .map_err(|e| Error::Extension(e.to_string()))
    }

    pub fn from_der(input: &[u8]) -> Result<Self, Error> {
        let (_, seq) = Sequence::from_der(input).map_err(|e| Error::Extension(e.to_string()))?;
        let content = seq.content.as_ref();
        let (rest, oid) = Oid::from_der(content).map_err(|e| Error::Extension(e.to_string()))?;
        let (_, value) =
            OctetString::from_der(rest).map_err(|e| Error::Extension(e.to_string()))?;
        Ok(Self {
            oid: oid.to_owned(),
            value: value.as_cow().to_vec(),
        })
    }
}

fn random_serial() -> Result<SerialNumber, Error> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; 8];
    rng.fill(&mut bytes)
        .map_err(|_| Error::Template("serial number randomness unavailable".to_string()))?;
    Ok(SerialNumber::from(u64::from_be_bytes(bytes)))
}

fn base_template(common_name: &str) -> Result<CertificateParams, Error> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, ORGANIZATION);
    params.distinguished_name = dn;

    params.serial_number = Some(random_serial()?);

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(VALIDITY_DAYS);

    Ok(params)
}

/// Template for a certificate-authority certificate: CA basic constraints
/// and cert/CRL signing key usage.
pub fn ca_template() -> Result<CertificateParams, Error> {
    let mut params = base_template("gridnode authority")?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    Ok(params)
}

/// Template for an end-entity certificate used on the TLS wire.
pub fn leaf_template() -> Result<CertificateParams, Error> {
    let mut params = base_template("gridnode peer")?;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    Ok(params)
}

/// Creates a certificate over `template` carrying `key`'s public key.
/// Signed by the parent when one is given, otherwise self-signed.
pub fn new_cert(
    key: &PrivateKey,
    parent: Option<(&Certificate, &PrivateKey)>,
    template: CertificateParams,
) -> Result<Certificate, Error> {
    let cert = match parent {
        None => template
            .self_signed(key.keypair())
            .map_err(|e| Error::Generate(e.to_string()))?,
        Some((parent_cert, parent_key)) => {
            let issuer_params =
                CertificateParams::from_ca_cert_der(&CertificateDer::from(parent_cert.der()))
                    .map_err(|e| Error::Template(e.to_string()))?;
            let issuer = issuer_params
                .self_signed(parent_key.keypair())
                .map_err(|e| Error::Template(e.to_string()))?;
            template
                .signed_by(key.keypair(), &issuer, parent_key.keypair())
                .map_err(|e| Error::Generate(e.to_string()))?
        }
    };
    Certificate::from_der(cert.der().to_vec())
}

/// Attaches the signed-cert extension to a leaf: an ASN.1 ECDSA signature by
/// the CA key over the leaf's raw DER, carried under `SIGNED_CERT_EXT_OID`.
pub fn add_signed_cert_ext(ca_key: &PrivateKey, leaf: &mut Certificate) -> Result<(), Error> {
    let signature = ca_key.sign_asn1(leaf.der())?;
    leaf.push_extension(PkixExtension {
        oid: SIGNED_CERT_EXT_OID,
        value: signature,
    });
    Ok(())
}

/// Checks the signed-cert extension on `leaf` against the CA's public key.
pub fn verify_signed_cert_ext(ca: &Certificate, leaf: &Certificate) -> Result<(), Error> {
    let ext = leaf
        .extra_extensions()
        .iter()
        .find(|e| e.oid == SIGNED_CERT_EXT_OID)
        .ok_or_else(|| Error::Extension("signed-cert extension missing".to_string()))?;

    let parsed = ca.parse()?;
    UnparsedPublicKey::new(
        &signature::ECDSA_P256_SHA256_ASN1,
        parsed.public_key().subject_public_key.data.as_ref(),
    )
    .verify(leaf.der(), &ext.value)
    .map_err(|_| Error::Extension("signed-cert extension signature invalid".to_string()))
}

/// Serializes a chain, leaf first, as concatenated PEM blocks. Detached
/// extensions follow their certificate as `PKIX EXTENSION` blocks.
pub fn chain_to_pem(chain: &[Certificate]) -> Result<String, Error> {
    if chain.is_empty() {
        return Err(Error::ChainLength);
    }
    let mut blocks = Vec::new();
    for cert in chain {
        blocks.push(Pem::new(CERT_TAG, cert.der().to_vec()));
        for ext in cert.extra_extensions() {
            blocks.push(Pem::new(EXTENSION_TAG, ext.to_der()?));
        }
    }
    Ok(pem::encode_many(&blocks))
}

/// Parses a PEM chain file, reattaching extension blocks to the certificate
/// they follow.
pub fn chain_from_pem(data: &[u8]) -> Result<Vec<Certificate>, Error> {
    let blocks = pem::parse_many(data)?;
    let mut chain: Vec<Certificate> = Vec::new();
    for block in blocks {
        match block.tag() {
            CERT_TAG => chain.push(Certificate::from_der(block.into_contents())?),
            EXTENSION_TAG => {
                let ext = PkixExtension::from_der(block.contents())?;
                match chain.last_mut() {
                    Some(cert) => cert.push_extension(ext),
                    None => {
                        return Err(Error::Parse(
                            "extension block precedes any certificate".to_string(),
                        ))
                    }
                }
            }
            other => return Err(Error::Parse(format!("unexpected PEM block {:?}", other))),
        }
    }
    Ok(chain)
}
