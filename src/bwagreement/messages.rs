use prost::Message;

use crate::peertls::Error;
use crate::pki::PrivateKey;

/// Satellite-signed allocation authorizing an uplink to spend bandwidth.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PayerBandwidthAllocation {
    #[prost(bytes = "vec", tag = "1")]
    pub satellite_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub uplink_id: Vec<u8>,
    #[prost(int64, tag = "3")]
    pub max_size: i64,
    #[prost(int64, tag = "4")]
    pub expiration_unix_sec: i64,
    #[prost(string, tag = "5")]
    pub serial_number: ::prost::alloc::string::String,
    #[prost(int64, tag = "6")]
    pub created_unix_sec: i64,
    #[prost(bytes = "vec", repeated, tag = "7")]
    pub certs: Vec<Vec<u8>>,
    #[prost(bytes = "vec", tag = "8")]
    pub signature: Vec<u8>,
}

/// Uplink-signed allocation a storage node submits after serving traffic.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RenterBandwidthAllocation {
    #[prost(message, optional, tag = "1")]
    pub payer_allocation: Option<PayerBandwidthAllocation>,
    #[prost(bytes = "vec", tag = "2")]
    pub storage_node_id: Vec<u8>,
    #[prost(int64, tag = "3")]
    pub total: i64,
    #[prost(bytes = "vec", repeated, tag = "4")]
    pub certs: Vec<Vec<u8>>,
    #[prost(bytes = "vec", tag = "5")]
    pub signature: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AgreementsSummary {
    #[prost(enumeration = "Status", tag = "1")]
    pub status: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Status {
    Fail = 0,
    Ok = 1,
    Rejected = 2,
}

impl AgreementsSummary {
    pub fn with_status(status: Status) -> Self {
        Self {
            status: status as i32,
        }
    }
}

impl PayerBandwidthAllocation {
    /// Canonical bytes the satellite signature covers: the message with
    /// `signature` and `certs` cleared, prost-encoded. Producers and
    /// verifiers must agree on these bytes bit-for-bit.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut cleared = self.clone();
        cleared.signature.clear();
        cleared.certs.clear();
        cleared.encode_to_vec()
    }

    /// Signs the allocation in place with the satellite key.
    pub fn sign(&mut self, key: &PrivateKey) -> Result<(), Error> {
        self.signature = key.sign_fixed(&self.signing_bytes())?;
        Ok(())
    }
}

impl RenterBandwidthAllocation {
    /// Canonical bytes the renter signature covers, mirroring
    /// `PayerBandwidthAllocation::signing_bytes`.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut cleared = self.clone();
        cleared.signature.clear();
        cleared.certs.clear();
        cleared.encode_to_vec()
    }

    /// Signs the allocation in place with the uplink key.
    pub fn sign(&mut self, key: &PrivateKey) -> Result<(), Error> {
        self.signature = key.sign_fixed(&self.signing_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pba() -> PayerBandwidthAllocation {
        PayerBandwidthAllocation {
            satellite_id: vec![1; 32],
            uplink_id: vec![2; 32],
            max_size: 1 << 20,
            expiration_unix_sec: 1_700_000_000,
            serial_number: "serial-42".to_string(),
            created_unix_sec: 1_699_990_000,
            certs: vec![vec![0xAA]],
            signature: vec![0xBB; 64],
        }
    }

    #[test]
    fn test_signing_bytes_clear_signature_and_certs() {
        let pba = sample_pba();
        let bytes = pba.signing_bytes();

        let decoded = PayerBandwidthAllocation::decode(bytes.as_slice()).unwrap();
        assert!(decoded.signature.is_empty());
        assert!(decoded.certs.is_empty());
        assert_eq!(decoded.serial_number, pba.serial_number);
        assert_eq!(decoded.expiration_unix_sec, pba.expiration_unix_sec);
    }

    #[test]
    fn test_signing_bytes_deterministic() {
        let pba = sample_pba();
        assert_eq!(pba.signing_bytes(), pba.signing_bytes());

        // Attached signature and certs do not change the signed form.
        let mut resigned = pba.clone();
        resigned.signature = vec![0xCC; 64];
        resigned.certs.clear();
        assert_eq!(pba.signing_bytes(), resigned.signing_bytes());
    }

    #[test]
    fn test_signing_bytes_cover_payload() {
        let pba = sample_pba();
        let mut altered = pba.clone();
        altered.max_size += 1;
        assert_ne!(pba.signing_bytes(), altered.signing_bytes());
    }

    #[test]
    fn test_sign_and_round_trip() {
        let key = crate::pki::PrivateKey::generate().unwrap();
        let mut rba = RenterBandwidthAllocation {
            payer_allocation: Some(sample_pba()),
            storage_node_id: vec![3; 32],
            total: 4096,
            certs: Vec::new(),
            signature: Vec::new(),
        };
        rba.sign(&key).unwrap();
        assert_eq!(rba.signature.len(), 64);

        let encoded = rba.encode_to_vec();
        let decoded = RenterBandwidthAllocation::decode(encoded.as_slice()).unwrap();
        assert_eq!(rba, decoded);
    }
}
