//! Key agreement and token derivation
//!
//! - key pairs are P-256 (secp256r1), public keys travel as 64 bytes X || Y
//! - the device secret is the first 16 bytes of the ECDH x-coordinate
//! - tokens are AES-128-CMAC over the lock's challenge, keyed by the device secret

use aes::Aes128;
use cmac::{Cmac, Mac};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use sesame_proto::PUBLIC_KEY_LEN;

pub const SHARED_SECRET_LEN: usize = 32;
pub const DEVICE_SECRET_LEN: usize = 16;
pub const TOKEN_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("peer public key is not a valid P-256 point")]
    InvalidPublicKey,
    #[error("private key bytes are not a valid P-256 scalar")]
    InvalidPrivateKey,
}

/// Ephemeral key pair for one registration attempt
pub struct KeyPair {
    secret: SecretKey,
    public: [u8; PUBLIC_KEY_LEN],
}

impl KeyPair {
    pub fn from_secret(secret: SecretKey) -> Self {
        let public = public_key_bytes(&secret.public_key());
        Self { secret, public }
    }

    /// Rebuild a key pair from a raw 32-byte scalar
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let secret = SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidPrivateKey)?;
        Ok(Self::from_secret(secret))
    }

    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.public
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Fresh key pair from a cryptographically secure source
pub fn generate_keypair<R: CryptoRng + RngCore>(rng: &mut R) -> KeyPair {
    KeyPair::from_secret(SecretKey::random(rng))
}

fn public_key_bytes(public: &PublicKey) -> [u8; PUBLIC_KEY_LEN] {
    let point = public.to_encoded_point(false);
    // uncompressed SEC1 is 0x04 || X || Y
    let mut out = [0u8; PUBLIC_KEY_LEN];
    out.copy_from_slice(&point.as_bytes()[1..]);
    out
}

fn parse_public_key(bytes: &[u8; PUBLIC_KEY_LEN]) -> Result<PublicKey, CryptoError> {
    let mut sec1 = [0u8; PUBLIC_KEY_LEN + 1];
    sec1[0] = 0x04;
    sec1[1..].copy_from_slice(bytes);
    PublicKey::from_sec1_bytes(&sec1).map_err(|_| CryptoError::InvalidPublicKey)
}

/// Raw ECDH output (x-coordinate of the shared point)
pub fn ecdh_shared_secret(
    peer_public: &[u8; PUBLIC_KEY_LEN],
    own_private: &SecretKey,
) -> Result<Zeroizing<[u8; SHARED_SECRET_LEN]>, CryptoError> {
    let peer = parse_public_key(peer_public)?;
    let shared = p256::ecdh::diffie_hellman(own_private.to_nonzero_scalar(), peer.as_affine());

    let mut out = Zeroizing::new([0u8; SHARED_SECRET_LEN]);
    out.copy_from_slice(shared.raw_secret_bytes());
    Ok(out)
}

/// Truncate the shared secret to the 16-byte device secret
pub fn device_secret(shared: &[u8; SHARED_SECRET_LEN]) -> Zeroizing<[u8; DEVICE_SECRET_LEN]> {
    let mut out = Zeroizing::new([0u8; DEVICE_SECRET_LEN]);
    out.copy_from_slice(&shared[..DEVICE_SECRET_LEN]);
    out
}

/// AES-128-CMAC
pub fn cmac(key: &[u8; DEVICE_SECRET_LEN], message: &[u8]) -> [u8; TOKEN_LEN] {
    let mut mac = <Cmac<Aes128> as Mac>::new(key.into());
    mac.update(message);

    let mut out = [0u8; TOKEN_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    const RFC4493_KEY: [u8; 16] = [
        0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f,
        0x3c,
    ];

    #[test]
    fn cmac_rfc4493_vectors() {
        assert_eq!(
            cmac(&RFC4493_KEY, &[]).to_vec(),
            hex("bb1d6929e95937287fa37d129b756746")
        );
        assert_eq!(
            cmac(&RFC4493_KEY, &hex("6bc1bee22e409f96e93d7e117393172a")).to_vec(),
            hex("070a16b46b4d4144f79bdd9dd04a287c")
        );
    }

    #[test]
    fn ecdh_agrees_in_both_directions() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let ours = generate_keypair(&mut rng);
        let theirs = generate_keypair(&mut rng);

        let a = ecdh_shared_secret(theirs.public_key(), ours.secret_key()).unwrap();
        let b = ecdh_shared_secret(ours.public_key(), theirs.secret_key()).unwrap();
        assert_eq!(*a, *b);
    }

    #[test]
    fn same_inputs_same_secret_and_token() {
        let ours = KeyPair::from_bytes(&[0x11; 32]).unwrap();
        let theirs = KeyPair::from_bytes(&[0x22; 32]).unwrap();
        let challenge = [0xDE, 0xAD, 0xBE, 0xEF];

        let derive = || {
            let shared = ecdh_shared_secret(theirs.public_key(), ours.secret_key()).unwrap();
            let secret = device_secret(&shared);
            (*secret, cmac(&secret, &challenge))
        };

        assert_eq!(derive(), derive());
    }

    #[test]
    fn public_key_is_uncompressed_without_prefix() {
        let pair = KeyPair::from_bytes(&[0x11; 32]).unwrap();
        let parsed = parse_public_key(pair.public_key()).unwrap();
        assert_eq!(&public_key_bytes(&parsed), pair.public_key());
    }

    #[test]
    fn off_curve_point_is_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let ours = generate_keypair(&mut rng);
        assert_eq!(
            ecdh_shared_secret(&[0x01; PUBLIC_KEY_LEN], ours.secret_key()).unwrap_err(),
            CryptoError::InvalidPublicKey
        );
    }

    #[test]
    fn zero_scalar_is_rejected() {
        assert_eq!(
            KeyPair::from_bytes(&[0; 32]).unwrap_err(),
            CryptoError::InvalidPrivateKey
        );
    }
}
