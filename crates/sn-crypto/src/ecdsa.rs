// SPDX-License-Identifier: AGPL-3.0-only
#![allow(clippy::result_large_err)]

use crate::{key_id, signed_message_digest, KeyId};
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorKeypair {
    pub sk: SecretKey,
    pub pk: PublicKey,
}

impl OperatorKeypair {
    pub fn from_secret_bytes(sk_bytes: &[u8; 32]) -> Result<Self, secp256k1::Error> {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(sk_bytes)?;
        let pk = PublicKey::from_secret_key(&secp, &sk);
        Ok(Self { sk, pk })
    }

    /// Komprimierter Public Key (33 Bytes)
    pub fn public_bytes(&self) -> [u8; 33] {
        self.pk.serialize()
    }

    pub fn key_id(&self) -> KeyId {
        key_id(&self.public_bytes())
    }
}

/// Signiert eine Klartext-Nachricht (Domain-Digest, kompakte 64-Byte-Signatur).
pub fn sign_message(msg: &[u8], kp: &OperatorKeypair) -> [u8; 64] {
    let secp = Secp256k1::new();
    let digest = signed_message_digest(msg);
    // Ein 32-Byte-Digest ist immer eine gültige Message
    let m = match Message::from_digest_slice(&digest) {
        Ok(m) => m,
        Err(_) => return [0u8; 64],
    };
    secp.sign_ecdsa(&m, &kp.sk).serialize_compact()
}

/// Prüft eine kompakte Signatur gegen einen serialisierten Public Key.
pub fn verify_message(pubkey_bytes: &[u8], sig64: &[u8], msg: &[u8]) -> bool {
    let pk = match PublicKey::from_slice(pubkey_bytes) {
        Ok(pk) => pk,
        Err(_) => return false,
    };
    let sig = match Signature::from_compact(sig64) {
        Ok(s) => s,
        Err(_) => return false,
    };
    let digest = signed_message_digest(msg);
    let m = match Message::from_digest_slice(&digest) {
        Ok(m) => m,
        Err(_) => return false,
    };
    let secp = Secp256k1::verification_only();
    secp.verify_ecdsa(&m, &sig, &pk).is_ok()
}
