//! Credits and secure identification.
//!
//! A credit record accumulates transfer byte counters against a peer's RSA
//! public key. SecIdent binds the record to the key via a
//! challenge/response: the responder signs the requester's public key and
//! challenge (plus, in protocol v2, an ip and ip-type) with its own
//! private key; the requester verifies with the responder's cached key.
//! Signatures are PKCS#1 v1.5 over SHA-1 with short keys, as the network
//! has always used.

use std::path::Path;

use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::pkcs1v15::{Signature as RsaSignature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use rustc_hash::FxHashMap;
use sha1::Sha1;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::opcodes::{IP_LOCAL, IP_NONE, IP_REMOTE};

/// Key length used across the network.
const KEY_BITS: usize = 384;

/// Errors from the credits subsystem.
#[derive(Debug, Error)]
pub enum CreditsError {
    /// RSA key handling failed.
    #[error("key error: {0}")]
    Key(String),
    /// A signature did not verify.
    #[error("signature verification failed")]
    BadSignature,
    /// Persistence I/O failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Byte counters bound to one peer key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Credit {
    /// Bytes we sent to the peer.
    pub uploaded: u64,
    /// Bytes we received from the peer.
    pub downloaded: u64,
    /// Unix seconds of the last verified contact.
    pub last_seen: u64,
}

impl Credit {
    /// Queue-score modifier: peers that gave us more than they took get
    /// ahead. Mirrors the classic ratio formula, clamped to `[1, 10]`.
    #[must_use]
    pub fn modifier(&self) -> f32 {
        if self.uploaded < 1024 * 1024 {
            return 1.0;
        }
        let by_ratio = self.downloaded as f32 * 2.0 / self.uploaded.max(1) as f32;
        let by_volume = ((self.downloaded as f32 / (1024.0 * 1024.0)) + 2.0).sqrt();
        by_ratio.min(by_volume).clamp(1.0, 10.0)
    }
}

/// The credit database: our own key pair plus per-key records.
pub struct CreditsDb {
    key: RsaPrivateKey,
    public_der: Vec<u8>,
    records: FxHashMap<Vec<u8>, Credit>,
}

impl CreditsDb {
    /// Generates a fresh key pair.
    pub fn generate() -> Result<Self, CreditsError> {
        let key = RsaPrivateKey::new(&mut OsRng, KEY_BITS)
            .map_err(|e| CreditsError::Key(e.to_string()))?;
        Self::with_key(key)
    }

    /// Loads the key from `path`, generating and saving one when missing.
    pub fn load_or_generate(path: &Path) -> Result<Self, CreditsError> {
        if path.exists() {
            let der = std::fs::read(path)?;
            let key = RsaPrivateKey::from_pkcs8_der(&der)
                .map_err(|e| CreditsError::Key(e.to_string()))?;
            info!(target: "ed2k::secident", path = %path.display(), "loaded crypt key");
            Self::with_key(key)
        } else {
            let db = Self::generate()?;
            let der = db
                .key
                .to_pkcs8_der()
                .map_err(|e| CreditsError::Key(e.to_string()))?;
            std::fs::write(path, der.as_bytes())?;
            info!(target: "ed2k::secident", path = %path.display(), "created crypt key");
            Ok(db)
        }
    }

    fn with_key(key: RsaPrivateKey) -> Result<Self, CreditsError> {
        let public_der = key
            .to_public_key()
            .to_public_key_der()
            .map_err(|e| CreditsError::Key(e.to_string()))?
            .as_bytes()
            .to_vec();
        Ok(Self {
            key,
            public_der,
            records: FxHashMap::default(),
        })
    }

    /// Our public key in the DER form sent on the wire.
    #[must_use]
    pub fn public_key(&self) -> &[u8] {
        &self.public_der
    }

    /// Looks up the record for a peer key.
    #[must_use]
    pub fn find(&self, pub_key: &[u8]) -> Option<Credit> {
        self.records.get(pub_key).copied()
    }

    /// Finds or creates the record for a peer key.
    pub fn create(&mut self, pub_key: &[u8]) -> Credit {
        *self.records.entry(pub_key.to_vec()).or_default()
    }

    /// Adds uploaded bytes to a peer's record.
    pub fn add_uploaded(&mut self, pub_key: &[u8], bytes: u64) {
        let rec = self.records.entry(pub_key.to_vec()).or_default();
        rec.uploaded = rec.uploaded.saturating_add(bytes);
    }

    /// Adds downloaded bytes to a peer's record.
    pub fn add_downloaded(&mut self, pub_key: &[u8], bytes: u64) {
        let rec = self.records.entry(pub_key.to_vec()).or_default();
        rec.downloaded = rec.downloaded.saturating_add(bytes);
    }

    /// Stamps the last verified contact time.
    pub fn touch(&mut self, pub_key: &[u8], now_secs: u64) {
        if let Some(rec) = self.records.get_mut(pub_key) {
            rec.last_seen = now_secs;
        }
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true when no records exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn challenge_message(their_pub_der: &[u8], challenge: u32, ip_type: u8, ip: u32) -> Vec<u8> {
        let mut msg = Vec::with_capacity(their_pub_der.len() + 9);
        msg.extend_from_slice(their_pub_der);
        msg.extend_from_slice(&challenge.to_le_bytes());
        if ip_type != IP_NONE {
            msg.extend_from_slice(&ip.to_le_bytes());
            msg.push(ip_type);
        }
        msg
    }

    /// Signs the peer's challenge with our private key. `their_pub_der` is
    /// the requester's public key, bound into the signed message.
    #[must_use]
    pub fn create_signature(
        &self,
        their_pub_der: &[u8],
        challenge: u32,
        ip_type: u8,
        ip: u32,
    ) -> Vec<u8> {
        let msg = Self::challenge_message(their_pub_der, challenge, ip_type, ip);
        let signer = SigningKey::<Sha1>::new(self.key.clone());
        signer.sign(&msg).to_vec()
    }

    /// Verifies a peer's signature over the challenge we sent it. The
    /// message binds *our* public key; `ip_type`/`ip` must match what the
    /// negotiated protocol version encodes.
    pub fn verify_signature(
        &self,
        their_pub_der: &[u8],
        sent_challenge: u32,
        signature: &[u8],
        ip_type: u8,
        ip: u32,
    ) -> Result<(), CreditsError> {
        let their_key = RsaPublicKey::from_public_key_der(their_pub_der)
            .map_err(|e| CreditsError::Key(e.to_string()))?;
        let msg = Self::challenge_message(&self.public_der, sent_challenge, ip_type, ip);
        let verifier = VerifyingKey::<Sha1>::new(their_key);
        let sig = RsaSignature::try_from(signature).map_err(|_| CreditsError::BadSignature)?;
        verifier
            .verify(&msg, &sig)
            .map_err(|_| CreditsError::BadSignature)
    }

    /// Saves record counters to `path` in a simple length-prefixed blob.
    pub fn save_records(&self, path: &Path) -> Result<(), CreditsError> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.records.len() as u32).to_le_bytes());
        for (key, rec) in &self.records {
            out.extend_from_slice(&(key.len() as u16).to_le_bytes());
            out.extend_from_slice(key);
            out.extend_from_slice(&rec.uploaded.to_le_bytes());
            out.extend_from_slice(&rec.downloaded.to_le_bytes());
            out.extend_from_slice(&rec.last_seen.to_le_bytes());
        }
        std::fs::write(path, out)?;
        debug!(target: "ed2k::secident", count = self.records.len(), "saved credit records");
        Ok(())
    }

    /// Loads record counters from `path`, replacing the current table.
    pub fn load_records(&mut self, path: &Path) -> Result<(), CreditsError> {
        fn take<'a>(data: &'a [u8], at: &mut usize, n: usize) -> Option<&'a [u8]> {
            if data.len() - *at < n {
                return None;
            }
            let s = &data[*at..*at + n];
            *at += n;
            Some(s)
        }

        let data = std::fs::read(path)?;
        let mut records = FxHashMap::default();
        let mut at = 0usize;
        let Some(count_bytes) = take(&data, &mut at, 4) else {
            warn!(target: "ed2k::secident", "credit file truncated");
            return Ok(());
        };
        let count = u32::from_le_bytes(count_bytes.try_into().expect("fixed length"));
        for _ in 0..count {
            let Some(len_bytes) = take(&data, &mut at, 2) else {
                break;
            };
            let key_len = u16::from_le_bytes(len_bytes.try_into().expect("fixed length"));
            let Some(key) = take(&data, &mut at, key_len as usize) else {
                break;
            };
            let key = key.to_vec();
            let Some(rest) = take(&data, &mut at, 24) else {
                break;
            };
            records.insert(
                key,
                Credit {
                    uploaded: u64::from_le_bytes(rest[..8].try_into().expect("fixed")),
                    downloaded: u64::from_le_bytes(rest[8..16].try_into().expect("fixed")),
                    last_seen: u64::from_le_bytes(rest[16..].try_into().expect("fixed")),
                },
            );
        }
        self.records = records;
        Ok(())
    }
}

/// Picks the ip type and ip value for a signature we *send*, per SecIdent
/// version: only v2 binds an ip (remote when we are low-id, local
/// otherwise); v1 and v3 send none.
#[must_use]
pub fn signature_ip_binding(
    sec_ident_ver: u8,
    our_id: u32,
    peer_id: u32,
) -> (u8, u32) {
    if sec_ident_ver == 2 {
        if crate::is_low_id(our_id) {
            (IP_REMOTE, peer_id)
        } else {
            (IP_LOCAL, our_id)
        }
    } else {
        (IP_NONE, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> CreditsDb {
        CreditsDb::generate().expect("key generation")
    }

    #[test]
    fn signature_round_trips_between_two_peers() {
        let alice = db();
        let bob = db();

        // alice challenges bob; bob signs alice's key + challenge
        let challenge = 0xdead_beef;
        let sig = bob.create_signature(alice.public_key(), challenge, IP_NONE, 0);
        alice
            .verify_signature(bob.public_key(), challenge, &sig, IP_NONE, 0)
            .expect("valid signature");
    }

    #[test]
    fn wrong_challenge_fails_verification() {
        let alice = db();
        let bob = db();
        let sig = bob.create_signature(alice.public_key(), 1, IP_NONE, 0);
        assert!(alice
            .verify_signature(bob.public_key(), 2, &sig, IP_NONE, 0)
            .is_err());
    }

    #[test]
    fn wrong_key_fails_verification() {
        let alice = db();
        let bob = db();
        let eve = db();
        let sig = eve.create_signature(alice.public_key(), 7, IP_NONE, 0);
        assert!(alice
            .verify_signature(bob.public_key(), 7, &sig, IP_NONE, 0)
            .is_err());
    }

    #[test]
    fn v2_binding_is_part_of_the_message() {
        let alice = db();
        let bob = db();
        let sig = bob.create_signature(alice.public_key(), 3, IP_LOCAL, 0x01020304);
        alice
            .verify_signature(bob.public_key(), 3, &sig, IP_LOCAL, 0x01020304)
            .expect("valid");
        assert!(alice
            .verify_signature(bob.public_key(), 3, &sig, IP_LOCAL, 0x01020305)
            .is_err());
        assert!(alice
            .verify_signature(bob.public_key(), 3, &sig, IP_NONE, 0)
            .is_err());
    }

    #[test]
    fn records_accumulate_per_key() {
        let mut d = db();
        let key = vec![1u8, 2, 3];
        d.add_uploaded(&key, 1000);
        d.add_downloaded(&key, 500);
        d.add_uploaded(&key, 24);
        let rec = d.find(&key).unwrap();
        assert_eq!(rec.uploaded, 1024);
        assert_eq!(rec.downloaded, 500);
    }

    #[test]
    fn records_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clients.met");
        let mut d = db();
        d.add_uploaded(b"key-a", 10);
        d.add_downloaded(b"key-b", 20);
        d.touch(b"key-a", 12345);
        d.save_records(&path).unwrap();

        let mut fresh = db();
        fresh.load_records(&path).unwrap();
        assert_eq!(fresh.len(), 2);
        assert_eq!(fresh.find(b"key-a").unwrap().uploaded, 10);
        assert_eq!(fresh.find(b"key-a").unwrap().last_seen, 12345);
        assert_eq!(fresh.find(b"key-b").unwrap().downloaded, 20);
    }

    #[test]
    fn key_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cryptkey.dat");
        let first = CreditsDb::load_or_generate(&path).unwrap();
        let second = CreditsDb::load_or_generate(&path).unwrap();
        assert_eq!(first.public_key(), second.public_key());
    }

    #[test]
    fn modifier_rewards_good_uploaders() {
        let newcomer = Credit::default();
        assert!((newcomer.modifier() - 1.0).abs() < f32::EPSILON);

        let generous = Credit {
            uploaded: 10 * 1024 * 1024,
            downloaded: 100 * 1024 * 1024,
            last_seen: 0,
        };
        assert!(generous.modifier() > 1.0);
        assert!(generous.modifier() <= 10.0);
    }

    #[test]
    fn v2_ip_binding_rules() {
        // we are low id: remote type, peer's id
        assert_eq!(signature_ip_binding(2, 100, 0x0a00_0001), (IP_REMOTE, 0x0a00_0001));
        // we are high id: local type, our id
        assert_eq!(
            signature_ip_binding(2, 0x0100_0000, 55),
            (IP_LOCAL, 0x0100_0000)
        );
        // v1 and v3 bind nothing
        assert_eq!(signature_ip_binding(1, 1, 2), (IP_NONE, 0));
        assert_eq!(signature_ip_binding(3, 1, 2), (IP_NONE, 0));
    }
}
