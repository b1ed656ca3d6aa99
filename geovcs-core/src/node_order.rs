//! Canonical ordering of tree node names and the bucketing scheme
//!
//! Node names are hashed with 64-bit FNV-1a over their UTF-16 code units.
//! Byte `d` of the hash (most significant first) picks the bucket a name
//! falls into at tree depth `d`. The per-depth limits below define the
//! storage format: changing them changes tree ids.

use std::cmp::Ordering;

const FNV64_OFFSET_BASIS: u64 = 14695981039346656037;
const FNV64_PRIME: u64 = 1099511628211;

/// Deepest level a tree can be split into buckets
pub const MAX_DEPTH: usize = 8;

/// 64-bit FNV-1a hash of a node name
pub fn hash_name(name: &str) -> u64 {
    let mut hash = FNV64_OFFSET_BASIS;
    for unit in name.encode_utf16() {
        let hi = (unit >> 8) as u8;
        let lo = unit as u8;
        hash = update(hash, hi);
        hash = update(hash, lo);
    }
    hash
}

// The octet is sign-extended before the xor.
fn update(hash: u64, octet: u8) -> u64 {
    let extended = octet as i8 as i64 as u64;
    (hash ^ extended).wrapping_mul(FNV64_PRIME)
}

/// Maximum number of direct entries a tree at `depth` holds before it is
/// split into buckets
pub fn normalized_size_limit(depth: usize) -> usize {
    match depth {
        0..=2 => 512,
        _ => 256,
    }
}

/// Number of buckets a tree at `depth` is split into
pub fn max_buckets_for_level(depth: usize) -> u32 {
    match depth {
        0..=2 => 32,
        3 | 4 => 8,
        5 | 6 => 4,
        _ => 2,
    }
}

fn byte_n(hash: u64, depth: usize) -> u32 {
    debug_assert!(depth < MAX_DEPTH);
    ((hash >> (8 * (7 - depth))) & 0xff) as u32
}

/// Bucket index for a name hash at `depth`
pub fn bucket_of_hash(hash: u64, depth: usize) -> u32 {
    byte_n(hash, depth) * max_buckets_for_level(depth) / 256
}

/// Bucket index for `name` at `depth`
pub fn bucket(name: &str, depth: usize) -> u32 {
    bucket_of_hash(hash_name(name), depth)
}

/// Canonical order: bucket indices at every depth, then the name itself
pub fn compare(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    let (ha, hb) = (hash_name(a), hash_name(b));
    for depth in 0..MAX_DEPTH {
        match bucket_of_hash(ha, depth).cmp(&bucket_of_hash(hb, depth)) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.cmp(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_name_hash_is_offset_basis() {
        assert_eq!(hash_name(""), FNV64_OFFSET_BASIS);
    }

    #[test]
    fn test_hash_is_deterministic_and_spreads() {
        assert_eq!(hash_name("feature.1"), hash_name("feature.1"));
        assert_ne!(hash_name("feature.1"), hash_name("feature.2"));
    }

    #[test]
    fn test_limits() {
        assert_eq!(normalized_size_limit(0), 512);
        assert_eq!(normalized_size_limit(2), 512);
        assert_eq!(normalized_size_limit(3), 256);
        assert_eq!(max_buckets_for_level(0), 32);
        assert_eq!(max_buckets_for_level(4), 8);
        assert_eq!(max_buckets_for_level(6), 4);
        assert_eq!(max_buckets_for_level(7), 2);
    }

    #[test]
    fn test_buckets_in_range() {
        for i in 0..2000 {
            let name = format!("n{}", i);
            for depth in 0..MAX_DEPTH {
                assert!(bucket(&name, depth) < max_buckets_for_level(depth));
            }
        }
    }

    #[test]
    fn test_compare_is_a_total_order() {
        let mut names: Vec<String> = (0..500).map(|i| format!("f{}", i)).collect();
        names.sort_by(|a, b| compare(a, b));
        for w in names.windows(2) {
            assert_eq!(compare(&w[0], &w[1]), Ordering::Less);
            assert_eq!(compare(&w[1], &w[0]), Ordering::Greater);
        }
        for w in names.windows(2) {
            assert!(bucket(&w[0], 0) <= bucket(&w[1], 0));
        }
    }
}
