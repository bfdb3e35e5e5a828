/// Mixes `salt` into `base` (splitmix64 finalizer), so neighbouring salts give
/// unrelated seeds.
pub fn derive_seed(base: u64, salt: u64) -> u64 {
    let mut z = base ^ salt.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
