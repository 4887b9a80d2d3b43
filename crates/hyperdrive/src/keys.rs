//! Content-log key derivation. The content feed's keypair is a pure
//! function of the metadata feed's secret key, so holding the one root
//! secret is enough to write both logs, and a reader only ever needs
//! the metadata public key plus the header block.

use blake2::digest::consts::U32;
use blake2::digest::FixedOutput;
use blake2::Blake2bMac;
use ed25519_dalek::SigningKey;
use zeroize::Zeroize;

const KDF_CONTEXT: &[u8; 8] = b"hyperdri";
const CONTENT_SUBKEY_ID: u64 = 1;

/// Derives the content feed keypair from the 64-byte metadata keypair:
/// a keyed blake2b-256 of the empty message (salt = subkey id, little
/// endian; personalization = the context string) seeds an ed25519
/// keypair. The seed is wiped before returning.
pub fn derive_content_keypair(metadata_secret: &[u8; 64]) -> SigningKey {
    let mut salt = [0u8; 16];
    salt[..8].copy_from_slice(&CONTENT_SUBKEY_ID.to_le_bytes());
    let mut personal = [0u8; 16];
    personal[..8].copy_from_slice(KDF_CONTEXT);

    let mac = Blake2bMac::<U32>::new_with_salt_and_personal(metadata_secret, &salt, &personal)
        .expect("key and parameter lengths are fixed and valid");
    let mut seed: [u8; 32] = mac.finalize_fixed().into();

    let keypair = SigningKey::from_bytes(&seed);
    seed.zeroize();
    keypair
}
