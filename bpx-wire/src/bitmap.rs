//! Bitmap segment codecs.
//!
//! Plain transfer ships the bitmap as little-endian 64-bit words. The
//! compressed form run-length-encodes the bit vector: runs alternate
//! between clear and set, each length written with the VLI code, with the
//! polarity of the first run carried in the segment's encoding byte.

use crate::packets::{CompressedBitmapInfo, BITMAP_CODE_RLE};
use crate::vli::{vli_decode, vli_encode, BitstreamReader, BitstreamWriter};
use bpx_core::{PlexError, Result};

#[must_use]
pub fn words_from_le_bytes(data: &[u8]) -> Vec<u64> {
    data.chunks(8)
        .map(|chunk| {
            let mut b = [0u8; 8];
            b[..chunk.len()].copy_from_slice(chunk);
            u64::from_le_bytes(b)
        })
        .collect()
}

#[must_use]
pub fn words_to_le_bytes(words: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * 8);
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
    }
    out
}

#[inline]
fn bit_at(words: &[u64], bit: u64) -> bool {
    (words[(bit / 64) as usize] >> (bit % 64)) & 1 != 0
}

/// RLE-compress `total_bits` of the word vector into a full segment payload
/// (encoding byte + bitstream). Returns `None` when the compressed form is
/// not smaller than the plain one, in which case the sender falls back to a
/// plain segment.
pub fn rle_encode(words: &[u64], total_bits: u64) -> Result<Option<Vec<u8>>> {
    if total_bits == 0 || (total_bits as usize).div_ceil(64) > words.len() {
        return Err(PlexError::Protocol("bitmap shorter than bit count".into()));
    }

    let first_run_set = bit_at(words, 0);
    let mut bs = BitstreamWriter::new();
    let mut run_start = 0u64;
    let mut current = first_run_set;
    for bit in 1..total_bits {
        let v = bit_at(words, bit);
        if v != current {
            vli_encode(&mut bs, bit - run_start)?;
            run_start = bit;
            current = v;
        }
    }
    vli_encode(&mut bs, total_bits - run_start)?;

    let info = CompressedBitmapInfo {
        code: BITMAP_CODE_RLE,
        pad_bits: bs.pad_bits(),
        first_run_set,
    };
    let stream = bs.into_bytes();
    let plain_len = (total_bits as usize).div_ceil(8);
    if stream.len() + 1 >= plain_len {
        return Ok(None);
    }

    let mut out = Vec::with_capacity(1 + stream.len());
    out.push(info.to_byte());
    out.extend_from_slice(&stream);
    Ok(Some(out))
}

/// Decode one compressed segment.
///
/// `start_bit` is where this segment continues in the overall bitmap;
/// `total_bits` bounds the decode. Returns the set runs as inclusive
/// `(first_bit, last_bit)` ranges plus the new bit offset. Overflowing the
/// bitmap or an unknown encoding code is a protocol error.
pub fn rle_decode(
    payload: &[u8],
    start_bit: u64,
    total_bits: u64,
) -> Result<(Vec<(u64, u64)>, u64)> {
    let (&info_byte, stream) = payload
        .split_first()
        .ok_or_else(|| PlexError::MalformedFrame("empty compressed bitmap".into()))?;
    let info = CompressedBitmapInfo::from_byte(info_byte);
    if info.code != BITMAP_CODE_RLE {
        return Err(PlexError::Protocol(format!(
            "unknown bitmap encoding {}",
            info.code
        )));
    }

    let mut bs = BitstreamReader::new(stream, info.pad_bits);
    let mut set_runs = Vec::new();
    let mut offset = start_bit;
    let mut toggle = info.first_run_set;

    while bs.remaining() > 0 {
        let run = vli_decode(&mut bs)?;
        let end = offset + run - 1;
        if end >= total_bits {
            return Err(PlexError::Protocol(format!(
                "bitmap overflow at bit {end} of {total_bits}"
            )));
        }
        if toggle {
            set_runs.push((offset, end));
        }
        offset += run;
        toggle = !toggle;
    }

    Ok((set_runs, offset))
}
