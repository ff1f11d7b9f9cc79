//! Helpers for the hex (nibble) representation of trie paths.
//!
//! Trie paths travel through the sync as raw nibble arrays (one byte per
//! nibble, values 0..=15, with an optional 0x10 leaf terminator). The wire
//! protocol carries them in hex-prefix ("compact") coding, and full-depth
//! account paths collapse to plain key bytes.

/// Leaf terminator nibble.
const TERMINATOR: u8 = 0x10;

/// Encodes a nibble path in hex-prefix form. The first byte carries the
/// oddness flag and, for leaf paths, the terminator flag.
pub fn hex_to_compact(hex: &[u8]) -> Vec<u8> {
    let (hex, terminator) = match hex.last() {
        Some(&TERMINATOR) => (&hex[..hex.len() - 1], 1u8),
        _ => (hex, 0u8),
    };
    let odd = (hex.len() % 2) as u8;
    let mut compact = Vec::with_capacity(hex.len() / 2 + 1);
    if odd == 1 {
        compact.push(0x10 * (2 * terminator + 1) + hex[0]);
    } else {
        compact.push(0x20 * terminator);
    }
    for pair in hex[odd as usize..].chunks_exact(2) {
        compact.push((pair[0] << 4) | pair[1]);
    }
    compact
}

/// Decodes hex-prefix coded bytes back into a nibble path.
pub fn compact_to_hex(compact: &[u8]) -> Vec<u8> {
    let Some(&first) = compact.first() else {
        return Vec::new();
    };
    let terminator = first & 0x20 != 0;
    let odd = first & 0x10 != 0;
    let mut hex = Vec::with_capacity(compact.len() * 2);
    if odd {
        hex.push(first & 0x0f);
    }
    for byte in &compact[1..] {
        hex.push(byte >> 4);
        hex.push(byte & 0x0f);
    }
    if terminator {
        hex.push(TERMINATOR);
    }
    hex
}

/// Packs a full-depth nibble path (even length, no terminator) into key bytes.
pub fn hex_to_keybytes(hex: &[u8]) -> Vec<u8> {
    let hex = match hex.last() {
        Some(&TERMINATOR) => &hex[..hex.len() - 1],
        _ => hex,
    };
    debug_assert!(hex.len() % 2 == 0, "odd nibble count cannot pack to bytes");
    hex.chunks_exact(2).map(|p| (p[0] << 4) | p[1]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_round_trip() {
        let cases: Vec<Vec<u8>> = vec![
            vec![],
            vec![0x1],
            vec![0x1, 0x2],
            vec![0x1, 0x2, 0x3],
            vec![0xf, 0x1, 0xc, 0xb, 0x8, TERMINATOR],
            vec![0xf, 0x1, 0xc, 0xb, TERMINATOR],
        ];
        for hex in cases {
            assert_eq!(compact_to_hex(&hex_to_compact(&hex)), hex, "path {hex:?}");
        }
    }

    #[test]
    fn compact_known_vectors() {
        // even, no terminator
        assert_eq!(hex_to_compact(&[0x1, 0x2, 0x3, 0x4]), vec![0x00, 0x12, 0x34]);
        // odd, no terminator
        assert_eq!(hex_to_compact(&[0x1, 0x2, 0x3]), vec![0x11, 0x23]);
        // even, terminator
        assert_eq!(
            hex_to_compact(&[0x1, 0x2, 0x3, 0x4, TERMINATOR]),
            vec![0x20, 0x12, 0x34]
        );
        // odd, terminator
        assert_eq!(hex_to_compact(&[0xf, 0x1, 0xc, TERMINATOR]), vec![0x3f, 0x1c]);
    }

    #[test]
    fn keybytes_packs_pairs() {
        assert_eq!(
            hex_to_keybytes(&[0x1, 0x2, 0xa, 0xb]),
            vec![0x12, 0xab]
        );
    }
}
