/*
    img3patch - An IMG3 decrypter, LZSS codec and kernelcache patcher
    Copyright (C) 2024 plzdonthaxme

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU General Public License as published by
    the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU General Public License for more details.

    You should have received a copy of the GNU General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

//! The `complzss` container used for kernelcaches: a 0x180 byte big endian
//! header followed by an Okumura style LZSS stream.

use {
    crate::utils::{
        round_up16, BinReaderExt, BinWrite, Cursor, Img3Error, LZSSHead, Result,
        LZSS_COMPRESSION_TYPE, LZSS_HEADER_LEN, LZSS_SIGNATURE,
    },
    byteorder::{BigEndian, ByteOrder},
    log::{debug, warn},
};

/// ring buffer size
pub const N: usize = 4096;
/// upper limit for a match length
pub const F: usize = 18;
/// matches must be longer than this to be encoded as a reference
pub const THRESHOLD: usize = 2;
// index for the root of a binary search tree, also "not in tree"
const NIL: usize = N;

const ADLER_MOD: u32 = 65521;
// one flag byte and eight two byte references
const GROUP_LEN: usize = 17;
// eight references of F bytes each
const GROUP_EXPANSION: usize = 8 * F;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decompressed {
    pub data: Vec<u8>,
    /// false when the header checksum does not match the data, some shipped images do this
    pub checksum_matched: bool,
}

#[must_use]
pub fn adler32(buf: &[u8]) -> u32 {
    let (mut s1, mut s2) = (1u32, 0u32);
    for &b in buf {
        s1 = (s1 + u32::from(b)) % ADLER_MOD;
        s2 = (s2 + s1) % ADLER_MOD;
    }
    (s2 << 16) | s1
}

/// Checks both magics of the header, lengths are not looked at.
#[must_use]
pub fn is_compressed(buf: &[u8]) -> bool {
    buf.len() >= 8
        && BigEndian::read_u32(&buf[0..4]) == LZSS_SIGNATURE
        && BigEndian::read_u32(&buf[4..8]) == LZSS_COMPRESSION_TYPE
}

/// # Errors
/// Returns an error if the buffer is too small or does not carry both magics
pub fn read_header(buf: &[u8]) -> Result<LZSSHead> {
    if buf.len() < LZSS_HEADER_LEN {
        return Err(Img3Error::InputTooSmall(buf.len()));
    }
    if !is_compressed(buf) {
        return Err(Img3Error::NotCompressed);
    }
    cast_struct!(LZSSHead, &buf[..LZSS_HEADER_LEN])
}

/// Expands an LZSS container into exactly `len_uncompressed` bytes.
///
/// Only `len_compressed` bytes after the header are consumed; a stream that
/// ends in the middle of a control byte is normal. If the stream produces
/// fewer bytes than announced, the rest of the output stays zeroed.
///
/// # Errors
/// Returns an error if the input is smaller than the header or is not compressed
pub fn decompress(input: &[u8]) -> Result<Decompressed> {
    let head = read_header(input)?;
    let body = &input[LZSS_HEADER_LEN..];
    let comp_len = try_cast!(head.len_compressed, usize)?;
    let avail = body.len().min(comp_len);
    if avail < comp_len {
        debug!("LZSS stream claims {comp_len:#x} bytes but only {avail:#x} are present");
    }

    let len_uncompressed = try_cast!(head.len_uncompressed, usize)?;
    if len_uncompressed > avail.div_ceil(GROUP_LEN).saturating_mul(GROUP_EXPANSION) {
        return Err(Img3Error::ExpansionTooLarge { uncompressed: len_uncompressed, compressed: avail });
    }
    let mut data = vec![0; len_uncompressed];

    let written = expand(&mut data, &body[..avail]);
    if written != data.len() {
        debug!("LZSS stream expanded to {written:#x} of {:#x} bytes", data.len());
    }

    let checksum = adler32(&data);
    let checksum_matched = checksum == head.checksum;
    if !checksum_matched {
        warn!(
            "LZSS checksum mismatch, header has {:#010x} but data is {checksum:#010x}",
            head.checksum
        );
    }
    Ok(Decompressed { data, checksum_matched })
}

// returns the amount of bytes written to dst
fn expand(dst: &mut [u8], src: &[u8]) -> usize {
    let mut text_buf = [0u8; N];
    text_buf[..N - F].fill(b' ');
    let mut r = N - F;
    let mut flags = 0u32;
    let mut out = 0;
    let mut src = src.iter().copied();

    loop {
        flags >>= 1;
        if flags & 0x100 == 0 {
            let Some(c) = src.next() else { break };
            flags = u32::from(c) | 0xFF00; // high byte counts the eight bits
        }
        if flags & 1 == 1 {
            let Some(c) = src.next() else { break };
            let Some(slot) = dst.get_mut(out) else { break };
            *slot = c;
            out += 1;
            text_buf[r] = c;
            r = (r + 1) & (N - 1);
        } else {
            let (Some(lo), Some(hi)) = (src.next(), src.next()) else { break };
            let pos = usize::from(lo) | ((usize::from(hi) & 0xF0) << 4);
            let len = (usize::from(hi) & 0x0F) + THRESHOLD;
            for k in 0..=len {
                let c = text_buf[(pos + k) & (N - 1)];
                let Some(slot) = dst.get_mut(out) else { return out };
                *slot = c;
                out += 1;
                text_buf[r] = c;
                r = (r + 1) & (N - 1);
            }
        }
    }
    out
}

/// Compresses `input` and prepends a filled in header.
///
/// The returned buffer is padded with zeroes to a 16 byte boundary, the
/// header's compressed length does not include that padding.
///
/// # Errors
/// Returns an error if the input is empty or the stream outgrows twice the input size
pub fn compress(input: &[u8]) -> Result<Vec<u8>> {
    if input.is_empty() {
        return Err(Img3Error::CompressionFailed("input is empty"));
    }
    let limit = input
        .len()
        .checked_mul(2)
        .and_then(|x| x.checked_add(LZSS_HEADER_LEN))
        .ok_or(Img3Error::Overflow("usize"))?;

    let mut out = Vec::with_capacity(limit);
    out.resize(LZSS_HEADER_LEN, 0);
    EncodeState::new().encode(input, &mut out, limit)?;

    let comp_len = out.len() - LZSS_HEADER_LEN;
    out.resize(round_up16(out.len()), 0);

    let head = LZSSHead::new(
        adler32(input),
        try_cast!(input.len(), u32)?,
        try_cast!(comp_len, u32)?,
    );
    struct_write!(head, out)?;
    debug!("Compressed {:#x} bytes into {comp_len:#x}", input.len());
    Ok(out)
}

/// Working set of the encoder: the ring buffer plus a binary search tree over
/// its positions, kept as parallel index arrays.
struct EncodeState {
    // extra F-1 bytes mirror the start of the ring so comparisons never wrap
    text_buf: Vec<u8>,
    lchild: Vec<usize>,
    rchild: Vec<usize>,
    parent: Vec<usize>,
    match_position: usize,
    match_length: usize,
}

impl EncodeState {
    fn new() -> Self {
        let mut text_buf = vec![0; N + F - 1];
        text_buf[..N - F].fill(b' ');
        Self {
            text_buf,
            lchild: vec![NIL; N + 257],
            rchild: vec![NIL; N + 257],
            parent: vec![NIL; N + 257],
            match_position: 0,
            match_length: 0,
        }
    }

    // insert the string at text_buf[r..r+F] and record the longest match
    fn insert_node(&mut self, r: usize) {
        let mut cmp = 1i32;
        let mut p = N + 1 + usize::from(self.text_buf[r]);
        self.rchild[r] = NIL;
        self.lchild[r] = NIL;
        self.match_length = 0;
        loop {
            if cmp >= 0 {
                if self.rchild[p] == NIL {
                    self.rchild[p] = r;
                    self.parent[r] = p;
                    return;
                }
                p = self.rchild[p];
            } else {
                if self.lchild[p] == NIL {
                    self.lchild[p] = r;
                    self.parent[r] = p;
                    return;
                }
                p = self.lchild[p];
            }
            let mut i = 1;
            while i < F {
                cmp = i32::from(self.text_buf[r + i]) - i32::from(self.text_buf[p + i]);
                if cmp != 0 {
                    break;
                }
                i += 1;
            }
            if i > self.match_length {
                self.match_position = p;
                self.match_length = i;
                if i >= F {
                    break;
                }
            }
        }

        // full match, r takes the place of p
        let (pl, pr, pp) = (self.lchild[p], self.rchild[p], self.parent[p]);
        self.parent[r] = pp;
        self.lchild[r] = pl;
        self.rchild[r] = pr;
        self.parent[pl] = r;
        self.parent[pr] = r;
        if self.rchild[pp] == p {
            self.rchild[pp] = r;
        } else {
            self.lchild[pp] = r;
        }
        self.parent[p] = NIL;
    }

    fn delete_node(&mut self, p: usize) {
        if self.parent[p] == NIL {
            return;
        }
        let q = if self.rchild[p] == NIL {
            self.lchild[p]
        } else if self.lchild[p] == NIL {
            self.rchild[p]
        } else {
            let mut q = self.lchild[p];
            if self.rchild[q] != NIL {
                while self.rchild[q] != NIL {
                    q = self.rchild[q];
                }
                let (ql, qp) = (self.lchild[q], self.parent[q]);
                self.rchild[qp] = ql;
                self.parent[ql] = qp;
                let pl = self.lchild[p];
                self.lchild[q] = pl;
                self.parent[pl] = q;
            }
            let pr = self.rchild[p];
            self.rchild[q] = pr;
            self.parent[pr] = q;
            q
        };
        let pp = self.parent[p];
        self.parent[q] = pp;
        if self.rchild[pp] == p {
            self.rchild[pp] = q;
        } else {
            self.lchild[pp] = q;
        }
        self.parent[p] = NIL;
    }

    #[allow(clippy::cast_possible_truncation)] // both halves are masked to a byte
    fn encode(&mut self, src: &[u8], out: &mut Vec<u8>, limit: usize) -> Result<()> {
        // code_buf[0] holds eight flags, 1 is a literal and 0 a position and length pair
        let mut code_buf = [0u8; 17];
        let mut code_buf_ptr = 1;
        let mut mask = 1u8;

        let mut s = 0;
        let mut r = N - F;
        let mut src = src.iter().copied();

        let mut len = 0;
        while len < F {
            let Some(c) = src.next() else { break };
            self.text_buf[r + len] = c;
            len += 1;
        }
        if len == 0 {
            return Err(Img3Error::CompressionFailed("input is empty"));
        }
        for i in 1..=F {
            self.insert_node(r - i);
        }
        self.insert_node(r);

        loop {
            if self.match_length > len {
                self.match_length = len;
            }
            if self.match_length <= THRESHOLD {
                self.match_length = 1;
                code_buf[0] |= mask;
                code_buf[code_buf_ptr] = self.text_buf[r];
                code_buf_ptr += 1;
            } else {
                code_buf[code_buf_ptr] = (self.match_position & 0xFF) as u8;
                code_buf[code_buf_ptr + 1] = (((self.match_position >> 4) & 0xF0)
                    | (self.match_length - (THRESHOLD + 1))) as u8;
                code_buf_ptr += 2;
            }
            mask <<= 1;
            if mask == 0 {
                flush(out, &code_buf[..code_buf_ptr], limit)?;
                code_buf[0] = 0;
                code_buf_ptr = 1;
                mask = 1;
            }

            let last_match_length = self.match_length;
            let mut i = 0;
            while i < last_match_length {
                let Some(c) = src.next() else { break };
                self.delete_node(s);
                self.text_buf[s] = c;
                if s < F - 1 {
                    self.text_buf[s + N] = c;
                }
                s = (s + 1) & (N - 1);
                r = (r + 1) & (N - 1);
                self.insert_node(r);
                i += 1;
            }
            // past the end of input, keep sliding over what is left in the window
            while i < last_match_length {
                i += 1;
                self.delete_node(s);
                s = (s + 1) & (N - 1);
                r = (r + 1) & (N - 1);
                len -= 1;
                if len != 0 {
                    self.insert_node(r);
                }
            }
            if len == 0 {
                break;
            }
        }

        if code_buf_ptr > 1 {
            flush(out, &code_buf[..code_buf_ptr], limit)?;
        }
        Ok(())
    }
}

fn flush(out: &mut Vec<u8>, code: &[u8], limit: usize) -> Result<()> {
    if out.len() + code.len() > limit {
        return Err(Img3Error::CompressionFailed("output buffer exhausted"));
    }
    out.extend_from_slice(code);
    Ok(())
}
