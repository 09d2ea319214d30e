use rand::{rngs::OsRng, CryptoRng, RngCore};

/// The RNG behind handshake randoms.
pub fn secure_rng() -> impl RngCore + CryptoRng {
    OsRng
}

/// Fill the provided buffer with secure randomness.
pub fn fill(dest: &mut [u8]) {
    let mut rng = secure_rng();
    rng.fill_bytes(dest);
}

/// Fresh fixed-size array of secure random bytes.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    fill(&mut out);
    out
}
