//! Byte-level mutation operators, plus the `havoc` stacked-mutation driver
//! and a two-parent `splice`.
//!
//! Every operator here is a pure function over `Vec<u8>`: same input and RNG
//! draws always produce the same output, and no operator ever grows its
//! input past `max_seed_size` (insertion is clamped at the cap; truncation,
//! where it happens, trims the tail).

use rand::Rng;

/// Maximum length of an `insert`/`havoc` insertion run.
const MAX_INSERT_LEN: usize = 32;
/// Maximum magnitude of an `arithmetic` delta.
const DEFAULT_ARITH_MAX: i16 = 35;

const INTERESTING_8: [u8; 5] = [0x00, 0x01, 0x7F, 0x80, 0xFF];
const INTERESTING_16: [u16; 5] = [0x0000, 0x0001, 0x7FFF, 0x8000, 0xFFFF];
const INTERESTING_32: [u32; 4] = [0x0000_0000, 0x7FFF_FFFF, 0x8000_0000, 0xFFFF_FFFF];

/// The closed set of mutation strategies `mutate` dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    BitFlip { k: usize },
    ByteFlip { k: usize },
    Arithmetic { max: i16 },
    Interesting,
    Insert,
    Delete,
    Havoc { iterations: usize },
    Splice,
}

impl Strategy {
    /// `havoc` with the given iteration count, the fuzz loop's default.
    pub fn havoc(iterations: usize) -> Self {
        Strategy::Havoc { iterations }
    }
}

fn clamp_to_cap(mut data: Vec<u8>, max_seed_size: usize) -> Vec<u8> {
    if data.len() > max_seed_size {
        data.truncate(max_seed_size);
    }
    data
}

/// Flips `k` randomly chosen bits, uniformly over all bit positions.
/// Identity on empty input.
pub fn bit_flip<R: Rng + ?Sized>(data: &[u8], k: usize, rng: &mut R) -> Vec<u8> {
    let mut out = data.to_vec();
    if out.is_empty() {
        return out;
    }
    let total_bits = out.len() * 8;
    for _ in 0..k {
        let bit = rng.gen_range(0..total_bits);
        out[bit / 8] ^= 1 << (bit % 8);
    }
    out
}

/// XORs `k` randomly chosen bytes with 0xFF. Identity on empty input.
pub fn byte_flip<R: Rng + ?Sized>(data: &[u8], k: usize, rng: &mut R) -> Vec<u8> {
    let mut out = data.to_vec();
    if out.is_empty() {
        return out;
    }
    for _ in 0..k {
        let pos = rng.gen_range(0..out.len());
        out[pos] ^= 0xFF;
    }
    out
}

/// Adds a random non-zero delta in `[-max, max]` to a random byte, modulo
/// 256. Identity on empty input.
pub fn arithmetic<R: Rng + ?Sized>(data: &[u8], max: i16, rng: &mut R) -> Vec<u8> {
    let mut out = data.to_vec();
    if out.is_empty() {
        return out;
    }
    let pos = rng.gen_range(0..out.len());
    let delta = loop {
        let d = rng.gen_range(-max..=max);
        if d != 0 {
            break d;
        }
    };
    out[pos] = (out[pos] as i16 + delta).rem_euclid(256) as u8;
    out
}

/// Overwrites a randomly chosen 1/2/4-byte window with an AFL "interesting"
/// value, randomly endian for 2/4-byte windows. Identity on empty input.
pub fn interesting_values<R: Rng + ?Sized>(data: &[u8], rng: &mut R) -> Vec<u8> {
    let mut out = data.to_vec();
    if out.is_empty() {
        return out;
    }
    let widths = [1usize, 2, 4]
        .into_iter()
        .filter(|&w| w <= out.len())
        .collect::<Vec<_>>();
    let width = widths[rng.gen_range(0..widths.len())];
    let pos = rng.gen_range(0..=out.len() - width);
    match width {
        1 => out[pos] = *INTERESTING_8.iter().nth(rng.gen_range(0..INTERESTING_8.len())).unwrap(),
        2 => {
            let v = INTERESTING_16[rng.gen_range(0..INTERESTING_16.len())];
            let bytes = if rng.gen_bool(0.5) {
                v.to_le_bytes()
            } else {
                v.to_be_bytes()
            };
            out[pos..pos + 2].copy_from_slice(&bytes);
        }
        4 => {
            let v = INTERESTING_32[rng.gen_range(0..INTERESTING_32.len())];
            let bytes = if rng.gen_bool(0.5) {
                v.to_le_bytes()
            } else {
                v.to_be_bytes()
            };
            out[pos..pos + 4].copy_from_slice(&bytes);
        }
        _ => unreachable!(),
    }
    out
}

/// Inserts a run of `[1, 32]` random bytes at a random position. Allowed on
/// empty input (inserts at position 0). The result is clamped to
/// `max_seed_size`.
pub fn insert<R: Rng + ?Sized>(data: &[u8], max_seed_size: usize, rng: &mut R) -> Vec<u8> {
    let mut out = data.to_vec();
    let len = rng.gen_range(1..=MAX_INSERT_LEN);
    let pos = if out.is_empty() {
        0
    } else {
        rng.gen_range(0..=out.len())
    };
    let chunk: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
    out.splice(pos..pos, chunk);
    clamp_to_cap(out, max_seed_size)
}

/// Removes a run of `[1, min(32, len/2)]` bytes at a random position.
/// No-op on input shorter than 2 bytes.
pub fn delete<R: Rng + ?Sized>(data: &[u8], rng: &mut R) -> Vec<u8> {
    let mut out = data.to_vec();
    if out.len() < 2 {
        return out;
    }
    let max_len = MAX_INSERT_LEN.min(out.len() / 2).max(1);
    let len = rng.gen_range(1..=max_len);
    let start = rng.gen_range(0..=out.len() - len);
    out.drain(start..start + len);
    out
}

/// Stacked random mutation: `iterations` rounds, each picking one of the six
/// primitive operators uniformly and feeding its output into the next
/// round. Bounded by `max_seed_size` throughout.
pub fn havoc<R: Rng + ?Sized>(
    data: &[u8],
    iterations: usize,
    max_seed_size: usize,
    rng: &mut R,
) -> Vec<u8> {
    let mut cur = data.to_vec();
    for _ in 0..iterations {
        cur = match rng.gen_range(0..6) {
            0 => bit_flip(&cur, 1, rng),
            1 => byte_flip(&cur, 1, rng),
            2 => arithmetic(&cur, DEFAULT_ARITH_MAX, rng),
            3 => interesting_values(&cur, rng),
            4 => insert(&cur, max_seed_size, rng),
            5 => delete(&cur, rng),
            _ => unreachable!(),
        };
        cur = clamp_to_cap(cur, max_seed_size);
    }
    cur
}

/// Two-parent crossover: splits `d1` at a random point `s1` and `d2` at a
/// random point `s2`, emits `d1[:s1] ++ d2[s2:]`, then runs one havoc pass
/// over the result. The pre-havoc splice always begins with a prefix of
/// `d1` and ends with a suffix of `d2`.
pub fn splice<R: Rng + ?Sized>(
    d1: &[u8],
    d2: &[u8],
    havoc_iterations: usize,
    max_seed_size: usize,
    rng: &mut R,
) -> Vec<u8> {
    let spliced = splice_crossover(d1, d2, rng);
    let spliced = clamp_to_cap(spliced, max_seed_size);
    havoc(&spliced, havoc_iterations, max_seed_size, rng)
}

/// The crossover half of `splice`, split out so the prefix/suffix property
/// can be tested without the subsequent havoc pass obscuring it.
pub fn splice_crossover<R: Rng + ?Sized>(d1: &[u8], d2: &[u8], rng: &mut R) -> Vec<u8> {
    let s1 = rng.gen_range(0..=d1.len());
    let s2 = rng.gen_range(0..=d2.len());
    let mut spliced = Vec::with_capacity(s1 + (d2.len() - s2));
    spliced.extend_from_slice(&d1[..s1]);
    spliced.extend_from_slice(&d2[s2..]);
    spliced
}

/// Dispatches on `strategy`. This is the sole public mutation entry point
/// used by the fuzz loop.
pub fn mutate<R: Rng + ?Sized>(
    data: &[u8],
    strategy: Strategy,
    max_seed_size: usize,
    splice_partner: Option<&[u8]>,
    rng: &mut R,
) -> Vec<u8> {
    let out = match strategy {
        Strategy::BitFlip { k } => bit_flip(data, k, rng),
        Strategy::ByteFlip { k } => byte_flip(data, k, rng),
        Strategy::Arithmetic { max } => arithmetic(data, max, rng),
        Strategy::Interesting => interesting_values(data, rng),
        Strategy::Insert => insert(data, max_seed_size, rng),
        Strategy::Delete => delete(data, rng),
        Strategy::Havoc { iterations } => havoc(data, iterations, max_seed_size, rng),
        Strategy::Splice => {
            let partner = splice_partner.expect("splice strategy requires a second parent");
            splice(data, partner, 16, max_seed_size, rng)
        }
    };
    clamp_to_cap(out, max_seed_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(1234)
    }

    #[test]
    fn empty_input_identity_for_most_operators() {
        let mut r = rng();
        assert!(bit_flip(&[], 5, &mut r).is_empty());
        assert!(byte_flip(&[], 5, &mut r).is_empty());
        assert!(arithmetic(&[], 35, &mut r).is_empty());
        assert!(interesting_values(&[], &mut r).is_empty());
        assert!(delete(&[], &mut r).is_empty());
        // insert is still allowed on empty input.
        assert!(!insert(&[], 1024, &mut r).is_empty());
    }

    #[test]
    fn mutators_respect_max_seed_size() {
        let mut r = rng();
        let data = vec![0u8; 100];
        for _ in 0..200 {
            let out = havoc(&data, 8, 50, &mut r);
            assert!(out.len() <= 50);
        }
    }

    #[test]
    fn delete_noop_below_two_bytes() {
        let mut r = rng();
        assert_eq!(delete(&[], &mut r), Vec::<u8>::new());
        assert_eq!(delete(&[7], &mut r), vec![7]);
    }

    #[test]
    fn splice_prefix_and_suffix_property() {
        let mut r = rng();
        let d1 = b"hello world".to_vec();
        let d2 = b"goodbye planet".to_vec();
        for _ in 0..50 {
            let spliced = splice_crossover(&d1, &d2, &mut r);
            let is_valid_split = (0..=d1.len()).any(|s1| {
                (0..=d2.len()).any(|s2| {
                    spliced.len() == s1 + (d2.len() - s2)
                        && spliced.starts_with(&d1[..s1])
                        && spliced.ends_with(&d2[s2..])
                })
            });
            assert!(is_valid_split, "{spliced:?} is not d1[:s1] ++ d2[s2:] for any s1, s2");
        }
    }

    #[test]
    fn havoc_bound_holds_under_repeated_growth() {
        let mut r = rng();
        let out = havoc(b"x", 500, 64, &mut r);
        assert!(out.len() <= 64);
    }
}
