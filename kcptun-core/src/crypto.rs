//! The authenticated, replay-resistant packet codec: seals and opens one UDP payload at a
//! time with libsodium's chacha20-poly1305-ietf AEAD (`ctor`-driven `sodium_init`), with a
//! monotonic per-direction nonce policy that tolerates reordering but rejects replay.

use byteorder::{BigEndian, WriteBytesExt};
use ctor::ctor;

pub const MAC_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_ABYTES as usize;
pub const KEY_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_KEYBYTES as usize;
pub const NONCE_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_NPUBBYTES as usize;

/// The large prime nonce increment. Chosen so a naive observer
/// cannot predict the next nonce from a sequence of prior ones, while a receiver can
/// still cheaply verify membership in the same residue class mod `NONCE_MAGIC`.
pub const NONCE_MAGIC: u64 = 999_999_937;

const CLIENT_TAG: &[u8] = b"kcptun-libev-client";
const SERVER_TAG: &[u8] = b"kcptun-libev-server";

/// Selects the AAD tag for a packet given the local role and whether we are sealing
/// (sending) or opening (receiving) it. Sealing uses our own tag; opening expects the
/// peer's tag, i.e. the complementary role. This is what prevents a client from replaying
/// one of its own sealed packets back at itself.
#[inline]
fn aad_tag(is_server: bool, is_seal: bool) -> &'static [u8] {
    let use_client_tag = is_server ^ is_seal;
    if use_client_tag {
        CLIENT_TAG
    } else {
        SERVER_TAG
    }
}

#[ctor]
fn init_sodium() {
    unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("libsodium initialization failed");
        }
    }
}

/// Fills `out` with cryptographically secure random bytes.
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(out.as_mut_ptr() as *mut std::ffi::c_void, out.len());
    }
}

/// Generates a fresh, random AEAD key suitable for use as a pre-shared key.
pub fn generate_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    unsafe {
        libsodium_sys::crypto_aead_chacha20poly1305_ietf_keygen(key.as_mut_ptr());
    }
    key
}

/// Derives an AEAD key from a password using Argon2id over a fixed public salt (the salt
/// itself is the BLAKE2b-256 digest of the literal string `"kcptun-libev"`, so every
/// endpoint derives the same salt without transmitting one), at the library's
/// interactive ops/mem limits.
pub fn derive_key(password: &str) -> Result<[u8; KEY_SIZE], String> {
    const SALT_STR: &[u8] = b"kcptun-libev";
    let mut salt = [0u8; libsodium_sys::crypto_pwhash_argon2id_SALTBYTES as usize];
    let r = unsafe {
        libsodium_sys::crypto_generichash(
            salt.as_mut_ptr(),
            salt.len(),
            SALT_STR.as_ptr(),
            SALT_STR.len() as u64,
            std::ptr::null(),
            0,
        )
    };
    if r != 0 {
        return Err("failed to derive salt".into());
    }

    let mut key = [0u8; KEY_SIZE];
    let r = unsafe {
        libsodium_sys::crypto_pwhash_argon2id(
            key.as_mut_ptr(),
            KEY_SIZE as u64,
            password.as_ptr() as *const std::os::raw::c_char,
            password.len() as u64,
            salt.as_ptr(),
            libsodium_sys::crypto_pwhash_argon2id_OPSLIMIT_INTERACTIVE as u64,
            libsodium_sys::crypto_pwhash_argon2id_MEMLIMIT_INTERACTIVE as usize,
            libsodium_sys::crypto_pwhash_argon2id_ALG_ARGON2ID13 as std::os::raw::c_int,
        )
    };
    if r != 0 {
        return Err("argon2id key derivation failed (likely out of memory)".into());
    }
    Ok(key)
}

/// Per-direction nonce bookkeeping. The sender side owns a
/// monotonically advancing counter; the receiver side owns the last accepted peer nonce.
pub struct NonceState {
    send: [u8; NONCE_SIZE],
    recv: Option<[u8; NONCE_SIZE]>,
}

impl NonceState {
    /// A fresh nonce state with a randomized starting counter.
    pub fn new() -> NonceState {
        let mut send = [0u8; NONCE_SIZE];
        random_bytes(&mut send);
        NonceState { send, recv: None }
    }

    /// Re-randomizes the send counter. Invoked by the client's keepalive timer after a
    /// prolonged silence, right before re-resolving peer addresses.
    pub fn reset_send(&mut self) {
        random_bytes(&mut self.send);
    }

    fn advance_send(&mut self) -> [u8; NONCE_SIZE] {
        let curr = u64::from_be_bytes(self.send[..8].try_into().unwrap());
        let mut next = curr.wrapping_add(NONCE_MAGIC);
        if next < curr {
            // Overflow: re-center so `next mod M` is preserved.
            let r0 = curr % NONCE_MAGIC;
            let r1 = next % NONCE_MAGIC;
            next = next.wrapping_add(NONCE_MAGIC - r1 + r0);
        }
        self.send[..8].copy_from_slice(&next.to_be_bytes());
        let mut suffix = [0u8; 4];
        random_bytes(&mut suffix);
        self.send[8..].copy_from_slice(&suffix);
        self.send
    }

    /// Verifies and accepts a candidate receive nonce: the first packet is always
    /// accepted and stored; subsequent packets must be congruent mod `NONCE_MAGIC` with
    /// the stored nonce.
    fn verify_and_store_recv(&mut self, candidate: &[u8]) -> bool {
        debug_assert_eq!(candidate.len(), NONCE_SIZE);
        match &self.recv {
            None => {
                let mut stored = [0u8; NONCE_SIZE];
                stored.copy_from_slice(candidate);
                self.recv = Some(stored);
                true
            }
            Some(saved) => {
                let r0 = u64::from_be_bytes(saved[..8].try_into().unwrap()) % NONCE_MAGIC;
                let r1 = u64::from_be_bytes(candidate[..8].try_into().unwrap()) % NONCE_MAGIC;
                if r0 == r1 {
                    let mut stored = [0u8; NONCE_SIZE];
                    stored.copy_from_slice(candidate);
                    self.recv = Some(stored);
                    true
                } else {
                    false
                }
            }
        }
    }
}

impl Default for NonceState {
    fn default() -> Self {
        Self::new()
    }
}

/// The packet codec: AEAD key plus per-direction nonce state, parametrized by whether
/// this endpoint is acting as the tunnel server or client (selects the AAD tag).
pub struct Codec {
    key: [u8; KEY_SIZE],
    nonce: NonceState,
    is_server: bool,
}

impl Codec {
    pub fn new(key: [u8; KEY_SIZE], is_server: bool) -> Codec {
        Codec {
            key,
            nonce: NonceState::new(),
            is_server,
        }
    }

    pub fn reset_send_nonce(&mut self) {
        self.nonce.reset_send();
    }

    /// Seals `buf[..plain_len]` in place, appending the AEAD tag and nonce, and returns
    /// the new total length. `buf` must have at least `plain_len + overhead()` bytes of
    /// capacity. Never allocates.
    pub fn seal_in_place(&mut self, buf: &mut [u8], plain_len: usize) -> usize {
        debug_assert!(buf.len() >= plain_len + self.overhead());
        let nonce = self.nonce.advance_send();
        let tag = aad_tag(self.is_server, true);

        let mut cipher_and_tag_len: u64 = 0;
        let r = unsafe {
            libsodium_sys::crypto_aead_chacha20poly1305_ietf_encrypt(
                buf.as_mut_ptr(),
                &mut cipher_and_tag_len,
                buf.as_ptr(),
                plain_len as u64,
                tag.as_ptr(),
                tag.len() as u64,
                std::ptr::null(),
                nonce.as_ptr(),
                self.key.as_ptr(),
            )
        };
        assert_eq!(r, 0, "chacha20poly1305 encryption failed");
        let sealed_len = cipher_and_tag_len as usize;
        buf[sealed_len..sealed_len + NONCE_SIZE].copy_from_slice(&nonce);
        sealed_len + NONCE_SIZE
    }

    /// Opens `buf[..len]` in place, verifying the trailing nonce against replay and the
    /// AEAD tag against forgery. Returns the plaintext length on success. Every failure
    /// mode -- truncated input, replay, or a forged tag -- collapses to `None`; the
    /// caller logs at most DEBUG and silently drops the packet.
    pub fn open_in_place(&mut self, buf: &mut [u8], len: usize) -> Option<usize> {
        if len <= NONCE_SIZE + MAC_SIZE {
            return None;
        }
        let nonce_off = len - NONCE_SIZE;
        let nonce = buf[nonce_off..len].to_vec();
        if !self.nonce.verify_and_store_recv(&nonce) {
            return None;
        }
        let cipher_len = nonce_off;
        let tag = aad_tag(self.is_server, false);

        let mut plain_len: u64 = 0;
        let r = unsafe {
            libsodium_sys::crypto_aead_chacha20poly1305_ietf_decrypt(
                buf.as_mut_ptr(),
                &mut plain_len,
                std::ptr::null_mut(),
                buf.as_ptr(),
                cipher_len as u64,
                tag.as_ptr(),
                tag.len() as u64,
                nonce.as_ptr(),
                self.key.as_ptr(),
            )
        };
        if r != 0 {
            return None;
        }
        Some(plain_len as usize)
    }

    /// Bytes added by `seal_in_place` beyond the plaintext length: tag plus nonce.
    #[inline]
    pub fn overhead(&self) -> usize {
        MAC_SIZE + NONCE_SIZE
    }
}

/// Encodes a raw key as base64 for inclusion in a config file or `--genpsk` output.
pub fn encode_psk(key: &[u8]) -> String {
    base64::encode(key)
}

pub fn decode_psk(s: &str) -> Result<[u8; KEY_SIZE], String> {
    let raw = base64::decode(s).map_err(|e| format!("invalid base64 psk: {}", e))?;
    if raw.len() != KEY_SIZE {
        return Err(format!(
            "psk must decode to {} bytes, got {}",
            KEY_SIZE,
            raw.len()
        ));
    }
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&raw);
    Ok(key)
}

/// Writes a big-endian millisecond timestamp, the payload shape shared by PING, PONG and
/// the KEEPALIVE echo.
pub fn write_tstamp(buf: &mut Vec<u8>, tstamp_ms: u32) {
    buf.write_u32::<BigEndian>(tstamp_ms).expect("vec write");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = generate_key();
        let mut sealer = Codec::new(key, true);
        let mut opener = Codec::new(key, false);

        let plain = b"hello, kcp tunnel";
        let mut buf = vec![0u8; plain.len() + sealer.overhead()];
        buf[..plain.len()].copy_from_slice(plain);
        let sealed_len = sealer.seal_in_place(&mut buf, plain.len());

        let opened_len = opener.open_in_place(&mut buf, sealed_len).unwrap();
        assert_eq!(&buf[..opened_len], plain);
    }

    #[test]
    fn stale_nonce_class_is_rejected() {
        // A nonce from a different residue class mod NONCE_MAGIC (e.g. a stale session
        // that rolled its counter independently) must be rejected outright.
        let key = generate_key();
        let mut opener = Codec::new(key, false);

        let plain = b"push data";
        let mut first = [0u8; NONCE_SIZE];
        random_bytes(&mut first);
        let mut buf1 = vec![0u8; plain.len() + MAC_SIZE + NONCE_SIZE];
        buf1[..plain.len()].copy_from_slice(plain);
        seal_with_nonce(&key, true, &mut buf1, plain.len(), first);
        assert!(opener.open_in_place(&mut buf1, buf1.len()).is_some());

        let mut unrelated = [0u8; NONCE_SIZE];
        random_bytes(&mut unrelated);
        let mut buf2 = vec![0u8; plain.len() + MAC_SIZE + NONCE_SIZE];
        buf2[..plain.len()].copy_from_slice(plain);
        seal_with_nonce(&key, true, &mut buf2, plain.len(), unrelated);
        assert!(opener.open_in_place(&mut buf2, buf2.len()).is_none());
    }

    fn seal_with_nonce(
        key: &[u8; KEY_SIZE],
        is_server: bool,
        buf: &mut [u8],
        plain_len: usize,
        nonce: [u8; NONCE_SIZE],
    ) {
        let tag = aad_tag(is_server, true);
        let mut cipher_and_tag_len: u64 = 0;
        unsafe {
            libsodium_sys::crypto_aead_chacha20poly1305_ietf_encrypt(
                buf.as_mut_ptr(),
                &mut cipher_and_tag_len,
                buf.as_ptr(),
                plain_len as u64,
                tag.as_ptr(),
                tag.len() as u64,
                std::ptr::null(),
                nonce.as_ptr(),
                key.as_ptr(),
            );
        }
        let sealed_len = cipher_and_tag_len as usize;
        buf[sealed_len..sealed_len + NONCE_SIZE].copy_from_slice(&nonce);
    }

    #[test]
    fn short_packet_is_dropped() {
        let key = generate_key();
        let mut opener = Codec::new(key, false);
        let mut buf = vec![0u8; NONCE_SIZE + MAC_SIZE];
        assert!(opener.open_in_place(&mut buf, buf.len()).is_none());
    }

    #[test]
    fn cross_role_reflection_is_rejected() {
        let key = generate_key();
        let mut client_sealer = Codec::new(key, false);
        // A server trying to open a packet another server sealed (same role) must fail,
        // since the AAD tag differs between client-origin and server-origin packets.
        let mut server_opener = Codec::new(key, true);

        let plain = b"reflected?";
        let mut buf = vec![0u8; plain.len() + client_sealer.overhead()];
        buf[..plain.len()].copy_from_slice(plain);
        let sealed_len = client_sealer.seal_in_place(&mut buf, plain.len());

        // Server opening a client-sealed packet is the *expected* path and must succeed.
        assert!(server_opener.open_in_place(&mut buf.clone(), sealed_len).is_some());

        // But a second server trying to open another server's sealed packet must fail.
        let mut other_server_sealer = Codec::new(key, true);
        let mut buf2 = vec![0u8; plain.len() + other_server_sealer.overhead()];
        buf2[..plain.len()].copy_from_slice(plain);
        let sealed_len2 = other_server_sealer.seal_in_place(&mut buf2, plain.len());
        assert!(server_opener.open_in_place(&mut buf2, sealed_len2).is_none());
    }

    #[test]
    fn nonce_monotonically_advances_mod_m() {
        let mut nonce = NonceState::new();
        let first = nonce.advance_send();
        let second = nonce.advance_send();
        let f = u64::from_be_bytes(first[..8].try_into().unwrap());
        let s = u64::from_be_bytes(second[..8].try_into().unwrap());
        assert_eq!(s.wrapping_sub(f) % NONCE_MAGIC, 0);
        assert_ne!(first[..8], second[..8]);
    }
}
