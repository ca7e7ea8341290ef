//! Injectable randomness source.
//!
//! Phrase, invite code, device id and share key generation all draw from a
//! `SecureRandom` handed in by the host, so each target platform can supply
//! its own CSPRNG.

use rand::rngs::OsRng;
use rand::RngCore;

/// A cryptographically secure source of random bytes.
pub trait SecureRandom: Send + Sync {
    /// Fill `buf` with random bytes.
    fn fill_bytes(&self, buf: &mut [u8]);

    /// Return `N` random bytes.
    fn bytes<const N: usize>(&self) -> [u8; N]
    where
        Self: Sized,
    {
        let mut out = [0u8; N];
        self.fill_bytes(&mut out);
        out
    }
}

/// Operating-system CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsSecureRandom;

impl SecureRandom for OsSecureRandom {
    fn fill_bytes(&self, buf: &mut [u8]) {
        OsRng.fill_bytes(buf);
    }
}

/// Fill a fixed-size array from a trait object.
pub(crate) fn random_array<const N: usize>(random: &dyn SecureRandom) -> [u8; N] {
    let mut out = [0u8; N];
    random.fill_bytes(&mut out);
    out
}
