use std::fmt;

use asn1_rs::{oid, Oid};
use rcgen::{KeyPair, PKCS_ECDSA_P256_SHA256};
use ring::rand::SystemRandom;
use ring::signature::{self, EcdsaKeyPair};
use x509_parser::prelude::{FromDer, SubjectPublicKeyInfo};
use zeroize::Zeroizing;

use crate::peertls::Error;

/// Byte length of the P-256 prime; message signatures must be at least this long.
pub const CURVE_PRIME_BYTES: usize = 32;

const EC_PUBLIC_KEY: Oid<'static> = oid!(1.2.840.10045.2.1);
const PRIME256V1: Oid<'static> = oid!(1.2.840.10045.3.1.7);

/// An ECDSA P-256 private key.
///
/// Wraps the keypair used for certificate operations together with a PKCS#8
/// copy for raw message signing. The PKCS#8 bytes are wiped on drop.
pub struct PrivateKey {
    keypair: KeyPair,
    pkcs8: Zeroizing<Vec<u8>>,
}

impl PrivateKey {
    /// Generates a fresh random key.
    pub fn generate() -> Result<Self, Error> {
        let keypair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::Generate(e.to_string()))?;
        let pkcs8 = Zeroizing::new(keypair.serialize_der());
        Ok(Self { keypair, pkcs8 })
    }

    /// Parses a PEM-encoded private key, rejecting anything that is not
    /// ECDSA P-256.
    pub fn from_pem(pem_str: &str) -> Result<Self, Error> {
        let keypair = KeyPair::from_pem(pem_str).map_err(|e| Error::Parse(e.to_string()))?;
        if keypair.algorithm() != &PKCS_ECDSA_P256_SHA256 {
            return Err(Error::UnsupportedKey(
                "private key is not ECDSA P-256".to_string(),
            ));
        }
        let pkcs8 = Zeroizing::new(keypair.serialize_der());
        Ok(Self { keypair, pkcs8 })
    }

    pub fn to_pem(&self) -> String {
        self.keypair.serialize_pem()
    }

    /// PKCS#8 DER encoding of the key.
    pub fn pkcs8_der(&self) -> &[u8] {
        &self.pkcs8
    }

    /// PKIX (SubjectPublicKeyInfo) DER encoding of the public key.
    pub fn public_key_der(&self) -> Vec<u8> {
        self.keypair.public_key_der()
    }

    pub(crate) fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    /// Signs `message` producing a fixed-width 64-byte r||s signature.
    /// Used for allocation messages and revocation records.
    pub fn sign_fixed(&self, message: &[u8]) -> Result<Vec<u8>, Error> {
        self.sign_with(&signature::ECDSA_P256_SHA256_FIXED_SIGNING, message)
    }

    /// Signs `message` producing an ASN.1 DER signature, the encoding used
    /// inside X.509 structures.
    pub fn sign_asn1(&self, message: &[u8]) -> Result<Vec<u8>, Error> {
        self.sign_with(&signature::ECDSA_P256_SHA256_ASN1_SIGNING, message)
    }

    fn sign_with(
        &self,
        alg: &'static signature::EcdsaSigningAlgorithm,
        message: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let rng = SystemRandom::new();
        let key = EcdsaKeyPair::from_pkcs8(alg, &self.pkcs8, &rng)
            .map_err(|e| Error::Generate(e.to_string()))?;
        let sig = key
            .sign(&rng, message)
            .map_err(|e| Error::Generate(e.to_string()))?;
        Ok(sig.as_ref().to_vec())
    }
}

// Never print key material.
impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("pkcs8", &"[REDACTED]")
            .finish()
    }
}

/// Validates a PKIX DER public key as ECDSA P-256 and returns the raw
/// uncompressed curve point, the form ring's verifiers consume.
pub fn ec_public_key_point(spki_der: &[u8]) -> Result<Vec<u8>, Error> {
    let (_, spki) =
        SubjectPublicKeyInfo::from_der(spki_der).map_err(|e| Error::Parse(e.to_string()))?;

    if spki.algorithm.algorithm != EC_PUBLIC_KEY {
        return Err(Error::UnsupportedKey(format!(
            "unsupported key algorithm {}",
            spki.algorithm.algorithm
        )));
    }

    let params = spki
        .algorithm
        .parameters
        .as_ref()
        .ok_or_else(|| Error::UnsupportedKey("missing EC curve parameters".to_string()))?;
    let curve: Oid = params
        .clone()
        .try_into()
        .map_err(|_| Error::UnsupportedKey("malformed EC curve parameters".to_string()))?;
    if curve != PRIME256V1 {
        return Err(Error::UnsupportedKey(format!("unsupported curve {}", curve)));
    }

    Ok(spki.subject_public_key.data.as_ref().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::signature::UnparsedPublicKey;

    #[test]
    fn test_pem_round_trip() {
        let key = PrivateKey::generate().unwrap();
        let reloaded = PrivateKey::from_pem(&key.to_pem()).unwrap();

        assert_eq!(key.public_key_der(), reloaded.public_key_der());
    }

    #[test]
    fn test_rejects_non_p256_key() {
        let ed25519 = rcgen::KeyPair::generate_for(&rcgen::PKCS_ED25519).unwrap();
        let err = PrivateKey::from_pem(&ed25519.serialize_pem()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedKey(_)));
    }

    #[test]
    fn test_public_key_point_extraction() {
        let key = PrivateKey::generate().unwrap();
        let point = ec_public_key_point(&key.public_key_der()).unwrap();

        // Uncompressed P-256 point: 0x04 || x || y.
        assert_eq!(point.len(), 65);
        assert_eq!(point[0], 0x04);
    }

    #[test]
    fn test_fixed_signature_verifies() {
        let key = PrivateKey::generate().unwrap();
        let message = b"bandwidth allocation";
        let sig = key.sign_fixed(message).unwrap();
        assert_eq!(sig.len(), 2 * CURVE_PRIME_BYTES);

        let point = ec_public_key_point(&key.public_key_der()).unwrap();
        UnparsedPublicKey::new(&signature::ECDSA_P256_SHA256_FIXED, &point)
            .verify(message, &sig)
            .unwrap();
    }

    #[test]
    fn test_asn1_signature_verifies() {
        let key = PrivateKey::generate().unwrap();
        let message = b"leaf certificate bytes";
        let sig = key.sign_asn1(message).unwrap();

        let point = ec_public_key_point(&key.public_key_der()).unwrap();
        UnparsedPublicKey::new(&signature::ECDSA_P256_SHA256_ASN1, &point)
            .verify(message, &sig)
            .unwrap();
    }

    #[test]
    fn test_debug_redacts_key_material() {
        let key = PrivateKey::generate().unwrap();
        let debug = format!("{:?}", key);
        assert!(debug.contains("REDACTED"));
    }
}
