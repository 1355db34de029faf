//! Nix-flavored base-32.
//!
//! Nix renders hashes in base-32 with a reduced alphabet (no `e`, `o`,
//! `u`, `t`) and with the digits emitted in reverse bit order compared
//! to conventional base-32. Store path hash parts and NAR hashes on the
//! wire both use this encoding.

const BASE32_CHARS: &[u8] = b"0123456789abcdfghijklmnpqrsvwxyz";

/// Encodes a byte slice into Nix base-32.
pub fn encode(bytes: &[u8]) -> String {
    let len = (bytes.len() * 8 - 1) / 5 + 1;

    (0..len)
        .rev()
        .map(|n| {
            let b = n * 5;
            let i = b / 8;
            let j = b % 8;
            let lo = bytes[i].checked_shr(j as u32).unwrap_or(0);
            let hi = if i >= bytes.len() - 1 {
                0
            } else {
                bytes[i + 1].checked_shl(8 - j as u32).unwrap_or(0)
            };
            char::from(BASE32_CHARS[(lo | hi) as usize % BASE32_CHARS.len()])
        })
        .collect()
}

/// Decodes a Nix base-32 string back into bytes.
///
/// Returns `None` on characters outside the alphabet or on non-zero
/// bits that do not fit the output length.
pub fn decode(s: &str) -> Option<Vec<u8>> {
    let s = s.as_bytes();
    let out_len = s.len() * 5 / 8;
    let mut out = vec![0u8; out_len];

    for n in 0..s.len() {
        let c = s[s.len() - n - 1];
        let digit = BASE32_CHARS.iter().position(|b| *b == c)? as u8;
        let b = n * 5;
        let i = b / 8;
        let j = b % 8;
        out[i] |= digit.checked_shl(j as u32).unwrap_or(0);

        let spill = digit.checked_shr(8 - j as u32).unwrap_or(0);
        if i < out_len - 1 {
            out[i + 1] |= spill;
        } else if spill != 0 {
            return None;
        }
    }

    Some(out)
}
