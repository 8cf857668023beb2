// SPDX-License-Identifier: AGPL-3.0-only
#![forbid(unsafe_code)]
#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented
)]

pub mod ecdsa;
pub mod score;

pub use ecdsa::{sign_message, verify_message, OperatorKeypair};
pub use score::ScoreU256;

use sha2::{Digest, Sha256};

pub type Hash32 = [u8; 32];
pub type KeyId = [u8; 20];

/// SHA-256 (32 Bytes)
pub fn sha256_32(data: &[u8]) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Doppeltes SHA-256 (32 Bytes)
pub fn sha256d_32(data: &[u8]) -> Hash32 {
    sha256_32(&sha256_32(data))
}

/// Kurz-ID eines serialisierten Public Keys: erste 20 Bytes von SHA-256d.
pub fn key_id(pubkey_bytes: &[u8]) -> KeyId {
    let h = sha256d_32(pubkey_bytes);
    let mut out = [0u8; 20];
    for (dst, src) in out.iter_mut().zip(h.iter()) {
        *dst = *src;
    }
    out
}

const SIGNED_MSG_DOMAIN: &[u8] = b"sentinel:signedmsg:v1\x01";

/// Digest für signierte Klartext-Nachrichten: SHA-256d(domain || msg).
/// Die Domain-Trennung verhindert Signatur-Wiederverwendung über Kontexte.
pub fn signed_message_digest(msg: &[u8]) -> Hash32 {
    let mut buf = Vec::with_capacity(SIGNED_MSG_DOMAIN.len() + msg.len());
    buf.extend_from_slice(SIGNED_MSG_DOMAIN);
    buf.extend_from_slice(msg);
    sha256d_32(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_len_and_determinism() {
        let a = sha256_32(b"test");
        let b = sha256_32(b"test");
        assert_eq!(a, b);
        assert_ne!(sha256_32(b"a"), sha256_32(b"b"));
        assert_ne!(sha256_32(b"x"), sha256d_32(b"x"));
    }

    #[test]
    fn key_id_is_prefix_of_double_hash() {
        let pk = [0x02u8; 33];
        let id = key_id(&pk);
        let full = sha256d_32(&pk);
        assert_eq!(&id[..], &full[..20]);
    }

    #[test]
    fn signed_message_digest_separates_domains() {
        // gleiche Bytes, aber Roh-Hash != Domain-Hash
        assert_ne!(signed_message_digest(b"m"), sha256d_32(b"m"));
        assert_eq!(signed_message_digest(b"m"), signed_message_digest(b"m"));
    }
}
