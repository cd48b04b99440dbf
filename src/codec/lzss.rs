//! The container's LZSS flavour: 4 KiB ring buffer pre-filled with spaces,
//! matches of 3..=18 bytes, one flag byte per eight items (bit set = literal,
//! least significant bit first). A match is two bytes: the low 8 bits of the
//! ring position, then the high 4 bits of the position and `length - 3`.

use super::{check_size, initial_capacity, Codec, CodecError};

const RING: usize = 4096;
const MAX_MATCH: usize = 18;
const MIN_MATCH: usize = 3;
const RING_START: usize = RING - MAX_MATCH;
const FILL: u8 = b' ';

// Matches never reach back further than this, so a copy never reads bytes it
// is overwriting.
const MAX_DISTANCE: usize = RING - MAX_MATCH;
const HASH_BITS: u32 = 12;
const MAX_CHAIN: usize = 64;

#[derive(Debug, Clone, Copy, Default)]
pub struct LzssCodec;

fn hash3(data: &[u8], i: usize) -> usize {
    let v = (data[i] as u32) << 16 | (data[i + 1] as u32) << 8 | data[i + 2] as u32;
    (v.wrapping_mul(2654435761) >> (32 - HASH_BITS)) as usize
}

impl LzssCodec {
    fn longest_match(data: &[u8], pos: usize, head: &[i64], prev: &[i64]) -> (usize, usize) {
        let mut best_len = 0;
        let mut best_pos = 0;
        if pos + MIN_MATCH > data.len() {
            return (0, 0);
        }
        let limit = (data.len() - pos).min(MAX_MATCH);
        let mut candidate = head[hash3(data, pos)];
        let mut chain = 0;
        while candidate >= 0 && chain < MAX_CHAIN {
            let cand = candidate as usize;
            if pos - cand > MAX_DISTANCE {
                break;
            }
            let mut len = 0;
            while len < limit && data[cand + len] == data[pos + len] {
                len += 1;
            }
            if len > best_len {
                best_len = len;
                best_pos = cand;
                if len == limit {
                    break;
                }
            }
            candidate = prev[cand];
            chain += 1;
        }
        (best_len, best_pos)
    }
}

impl Codec for LzssCodec {
    fn name(&self) -> &'static str {
        "lzss"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(data.len() / 2 + 16);
        let mut head = vec![-1i64; 1 << HASH_BITS];
        let mut prev = vec![-1i64; data.len()];

        let mut flag_pos = 0usize;
        let mut flag_bit = 8u32;
        let mut pos = 0usize;

        let insert = |head: &mut [i64], prev: &mut [i64], i: usize| {
            if i + MIN_MATCH <= data.len() {
                let h = hash3(data, i);
                prev[i] = head[h];
                head[h] = i as i64;
            }
        };

        while pos < data.len() {
            if flag_bit == 8 {
                flag_pos = out.len();
                out.push(0);
                flag_bit = 0;
            }

            let (len, at) = Self::longest_match(data, pos, &head, &prev);
            if len >= MIN_MATCH {
                let ring_pos = (RING_START + at) & (RING - 1);
                out.push((ring_pos & 0xFF) as u8);
                out.push((((ring_pos >> 4) & 0xF0) | (len - MIN_MATCH)) as u8);
                for i in pos..pos + len {
                    insert(&mut head, &mut prev, i);
                }
                pos += len;
            } else {
                out[flag_pos] |= 1 << flag_bit;
                out.push(data[pos]);
                insert(&mut head, &mut prev, pos);
                pos += 1;
            }
            flag_bit += 1;
        }
        Ok(out)
    }

    fn decompress(&self, data: &[u8], expected: usize) -> Result<Vec<u8>, CodecError> {
        let mut ring = [FILL; RING];
        let mut r = RING_START;
        let mut out = Vec::with_capacity(initial_capacity(data.len(), expected));
        let mut input = data.iter().copied();

        'outer: while out.len() < expected {
            let Some(flags) = input.next() else { break };
            for bit in 0..8 {
                if out.len() >= expected {
                    break 'outer;
                }
                if flags & (1 << bit) != 0 {
                    let Some(byte) = input.next() else { break 'outer };
                    out.push(byte);
                    ring[r] = byte;
                    r = (r + 1) & (RING - 1);
                } else {
                    let (Some(lo), Some(hi)) = (input.next(), input.next()) else {
                        return Err(CodecError::Corrupt { codec: "lzss", reason: "truncated match".into() });
                    };
                    let mut src = lo as usize | ((hi as usize & 0xF0) << 4);
                    let len = (hi as usize & 0x0F) + MIN_MATCH;
                    for _ in 0..len {
                        let byte = ring[src];
                        out.push(byte);
                        ring[r] = byte;
                        r = (r + 1) & (RING - 1);
                        src = (src + 1) & (RING - 1);
                    }
                }
            }
        }

        if out.len() > expected {
            return Err(CodecError::Corrupt { codec: "lzss", reason: "match runs past the recorded size".into() });
        }
        check_size("lzss", out, expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_sizes() {
        let codec = LzssCodec;
        let repetitive: Vec<u8> = b"abcabcabcabd".iter().cycle().take(70_000).copied().collect();
        for data in [Vec::new(), vec![7u8], repetitive] {
            let packed = codec.compress(&data).unwrap();
            assert_eq!(codec.decompress(&packed, data.len()).unwrap(), data);
        }
    }

    #[test]
    fn repetitive_input_shrinks() {
        let data = vec![b'x'; 10_000];
        let packed = LzssCodec.compress(&data).unwrap();
        assert!(packed.len() < data.len() / 4);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 7) as u8).collect();
        let packed = LzssCodec.compress(&data).unwrap();
        assert!(LzssCodec.decompress(&packed[..packed.len() / 2], data.len()).is_err());
    }
}
