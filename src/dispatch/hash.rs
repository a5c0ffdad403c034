//! Sticky key hashing for key-shared routing.
//!
//! Keys hash with Murmur3 (x86, 32-bit, seed 0) into the range
//! `[0, STICKY_KEY_HASH_RANGE_SIZE)` so that every broker routes a key to
//! the same slot regardless of which process computes it.

use crate::constants::STICKY_KEY_HASH_RANGE_SIZE;

const C1: u32 = 0xcc9e_2d51;
const C2: u32 = 0x1b87_3593;

/// Murmur3 x86 32-bit hash.
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    let mut h = seed;
    let mut chunks = data.chunks_exact(4);

    for chunk in &mut chunks {
        let k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        h ^= mix_k(k);
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k: u32 = 0;
        for (i, byte) in tail.iter().enumerate() {
            k |= (*byte as u32) << (8 * i);
        }
        h ^= mix_k(k);
    }

    h ^= data.len() as u32;
    fmix(h)
}

#[inline]
fn mix_k(k: u32) -> u32 {
    k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2)
}

#[inline]
fn fmix(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// Slot of a sticky key in the key-shared hash space.
pub fn sticky_key_hash(key: &[u8]) -> u32 {
    (murmur3_32(key, 0) & 0x7fff_ffff) % STICKY_KEY_HASH_RANGE_SIZE
}
