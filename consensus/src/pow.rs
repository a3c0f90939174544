//! Proof-of-work rules for header chains.

use num_bigint::BigUint;
use num_traits::{One, Zero};

use crate::header::{BlockHash, BlockHeader};

/// Difficulty bits of the mainnet genesis block.
pub const GENESIS_POW_BITS: u32 = 0x1d00_ffff;

/// Regtest difficulty: roughly every other hash qualifies.
pub const REGTEST_POW_BITS: u32 = 0x207f_ffff;

/// Expands compact difficulty bits into the full 256-bit target.
///
/// The top byte is a base-256 exponent, the lower three bytes the mantissa:
/// `target = mantissa * 256^(exponent - 3)`.
pub fn bits_to_target(bits: u32) -> BigUint {
    let exponent = bits >> 24;
    let mantissa = bits & 0x00ff_ffff;
    let target = BigUint::from(mantissa);
    if exponent > 3 {
        target << (8 * (exponent - 3))
    } else {
        target >> (8 * (3 - exponent))
    }
}

/// Interprets a hash in internal byte order as an unsigned integer.
pub fn hash_to_uint(hash: &BlockHash) -> BigUint {
    BigUint::from_bytes_le(hash)
}

pub fn meets_difficulty(header: &BlockHeader) -> bool {
    hash_to_uint(&header.hash()) <= bits_to_target(header.bits)
}

/// Work credited for one header, `2^256 / target`. A zero target earns nothing.
pub fn header_work(bits: u32) -> BigUint {
    let target = bits_to_target(bits);
    if target.is_zero() {
        return BigUint::zero();
    }
    (BigUint::one() << 256u32) / target
}

/// Walks `headers` from index 1, checking each header links to its
/// predecessor and meets its own target. Returns the summed work of the
/// checked headers, or zero work and `false` at the first failure.
pub fn validate_chain(headers: &[BlockHeader]) -> (BigUint, bool) {
    let mut work = BigUint::zero();
    for pair in headers.windows(2) {
        let (previous, current) = (&pair[0], &pair[1]);
        if current.prev_block_hash != previous.hash() || !meets_difficulty(current) {
            return (BigUint::zero(), false);
        }
        work += header_work(current.bits);
    }
    (work, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::ZERO_HASH;
    use proptest::prelude::*;

    /// Target above 2^256, so every hash qualifies.
    const TRIVIAL_BITS: u32 = 0x2200_ffff;

    fn header(prev: BlockHash, nonce: u32, bits: u32) -> BlockHeader {
        BlockHeader {
            version: 4,
            prev_block_hash: prev,
            merkle_root: [nonce as u8; 32],
            timestamp: 1_700_000_000 + nonce,
            bits,
            nonce,
            tx_count: 0,
        }
    }

    fn mine(mut header: BlockHeader) -> BlockHeader {
        while !meets_difficulty(&header) {
            header.nonce = header.nonce.wrapping_add(1);
        }
        header
    }

    fn chain(len: usize, bits: u32) -> Vec<BlockHeader> {
        let mut prev = ZERO_HASH;
        (0..len)
            .map(|i| {
                let next = mine(header(prev, i as u32, bits));
                prev = next.hash();
                next
            })
            .collect()
    }

    #[test]
    fn genesis_bits_expand_to_known_target() {
        let expected = BigUint::parse_bytes(
            b"00000000FFFF0000000000000000000000000000000000000000000000000000",
            16,
        )
        .unwrap();
        assert_eq!(bits_to_target(GENESIS_POW_BITS), expected);
    }

    #[test]
    fn small_exponent_shifts_right() {
        assert_eq!(bits_to_target(0x0212_3456), BigUint::from(0x1234u32));
        assert_eq!(bits_to_target(0x0300_ffff), BigUint::from(0xffffu32));
    }

    #[test]
    fn genesis_work_per_header() {
        assert_eq!(header_work(GENESIS_POW_BITS), BigUint::from(4_295_032_833u64));
        assert!(header_work(0).is_zero());
    }

    #[test]
    fn regtest_chain_accumulates_work_after_first_header() {
        let headers = chain(4, REGTEST_POW_BITS);
        let (work, valid) = validate_chain(&headers);
        assert!(valid);
        assert_eq!(work, header_work(REGTEST_POW_BITS) * 3u32);
    }

    #[test]
    fn short_inputs_are_trivially_valid() {
        assert_eq!(validate_chain(&[]), (BigUint::zero(), true));
        let single = header(ZERO_HASH, 0, GENESIS_POW_BITS);
        assert_eq!(validate_chain(&[single]), (BigUint::zero(), true));
    }

    #[test]
    fn insufficient_work_fails_and_discards_work() {
        let mut headers = chain(3, TRIVIAL_BITS);
        let weak = header(headers[2].hash(), 42, GENESIS_POW_BITS);
        assert!(!meets_difficulty(&weak));
        headers.push(weak);
        assert_eq!(validate_chain(&headers), (BigUint::zero(), false));
    }

    proptest! {
        #[test]
        fn valid_iff_every_link_holds(len in 2usize..12, broken in proptest::option::of(1usize..12)) {
            let mut headers = chain(len, TRIVIAL_BITS);
            let broken = broken.filter(|index| *index < len);
            if let Some(index) = broken {
                headers[index].prev_block_hash[0] ^= 0xff;
            }
            let (_, valid) = validate_chain(&headers);
            prop_assert_eq!(valid, broken.is_none());
        }
    }
}
