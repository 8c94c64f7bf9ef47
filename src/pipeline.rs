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

//! Decrypt, decompress, patch, recompress, encrypt and write back one section.
//! Compression is only undone and redone when the decrypted payload carries
//! an LZSS header.

use {
    crate::{
        crypto::AesKey,
        img3::{Container, SectionKind},
        lzss,
        utils::{round_up16, Img3Error, Result},
    },
    byteorder::{ByteOrder, NativeEndian},
    log::{debug, info, warn},
    std::{fs, path::Path},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Patch {
    pub address: u32,
    pub value: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plaintext {
    pub data: Vec<u8>,
    pub compressed: bool,
    pub checksum_matched: bool,
}

// same leniency as scanf's %x
fn parse_hex(tok: &str) -> Option<u32> {
    let digits = tok
        .strip_prefix("0x")
        .or_else(|| tok.strip_prefix("0X"))
        .unwrap_or(tok);
    u32::from_str_radix(digits, 16).ok()
}

/// Reads `<address> <value>` pairs in hex, one per line.
///
/// Reading stops at the first line without two values, usually the empty last line.
#[must_use]
pub fn parse_patches(text: &str) -> Vec<Patch> {
    let mut patches = Vec::new();
    for line in text.lines() {
        let mut toks = line.split_whitespace();
        let (Some(address), Some(value)) = (
            toks.next().and_then(parse_hex),
            toks.next().and_then(parse_hex),
        ) else {
            break;
        };
        patches.push(Patch { address, value });
    }
    patches
}

/// # Errors
/// Returns an error if the file cannot be read
pub fn read_patch_file(path: impl AsRef<Path>) -> Result<Vec<Patch>> {
    let text = fs::read_to_string(path)?;
    Ok(parse_patches(&text))
}

/// Decrypts the first `len` bytes of `window`, rounded up to a whole block.
///
/// The bytes after the declared length are decrypted too, the checksum of the
/// inner stream covers them. When the window ends first the block is zero filled.
///
/// # Errors
/// Returns an error if the window is shorter than `len` or decryption fails
pub fn decrypt_section(window: &[u8], len: usize, key: &AesKey) -> Result<Vec<u8>> {
    if window.len() < len {
        return Err(Img3Error::Truncated { what: "encrypted payload", offset: window.len() });
    }
    let aligned = round_up16(len);
    let mut buf = window[..aligned.min(window.len())].to_vec();
    if buf.len() < aligned {
        warn!(
            "Only {:#x} of {aligned:#x} bytes are present for the last block, padding with zeroes",
            buf.len()
        );
        buf.resize(aligned, 0);
    }
    debug!("Decrypting {aligned:#x} bytes with {key:?}");
    key.decrypt(&buf)
}

/// # Errors
/// Returns an error if the payload has an LZSS header but cannot be decompressed
pub fn maybe_decompress(plain: Vec<u8>) -> Result<Plaintext> {
    if !lzss::is_compressed(&plain) {
        return Ok(Plaintext { data: plain, compressed: false, checksum_matched: true });
    }
    info!("Data appears to be compressed, decompressing {:#x} bytes", plain.len());
    let out = lzss::decompress(&plain)?;
    Ok(Plaintext {
        data: out.data,
        compressed: true,
        checksum_matched: out.checksum_matched,
    })
}

/// Writes every patch value as a host order word, in order.
/// Patches that do not fit completely inside `bytes` are skipped.
/// Returns how many were applied.
pub fn apply_patches(bytes: &mut [u8], patches: &[Patch]) -> usize {
    let mut applied = 0;
    for patch in patches {
        let addr = patch.address as usize;
        let Some(word) = addr.checked_add(4).and_then(|end| bytes.get_mut(addr..end)) else {
            warn!("The patch at address {:#010x} appears to be outside the file", patch.address);
            continue;
        };
        info!("Applying patch at address {:#010x} with value {:#010x}", patch.address, patch.value);
        NativeEndian::write_u32(word, patch.value);
        applied += 1;
    }
    applied
}

/// # Errors
/// Returns an error if compression fails
pub fn maybe_recompress(data: &[u8], compressed: bool) -> Result<Vec<u8>> {
    if compressed {
        info!("Recompressing {:#x} bytes", data.len());
        lzss::compress(data)
    } else {
        Ok(data.to_vec())
    }
}

/// Zero pads to a whole block and encrypts.
///
/// # Errors
/// Returns an error if encryption fails
pub fn encrypt_section(data: &[u8], key: &AesKey) -> Result<Vec<u8>> {
    let mut buf = data.to_vec();
    buf.resize(round_up16(data.len()), 0);
    key.encrypt(&buf)
}

/// Puts re-encrypted bytes back in place of the section's payload.
///
/// The replacement must be exactly as long as the block aligned original and
/// must fit inside its section, nothing after the section is ever moved.
///
/// # Errors
/// Returns an error if the section is missing or the sizes differ
pub fn commit(cont: &mut Container, kind: SectionKind, ciphertext: Vec<u8>) -> Result<()> {
    let sect = cont
        .get_section(kind)
        .ok_or(Img3Error::SectionNotFound(kind.name()))?;
    let slot = round_up16(try_cast!(sect.header.data_len, usize)?);
    if ciphertext.len() != slot {
        return Err(Img3Error::SizeMismatch { expected: slot, actual: ciphertext.len() });
    }
    let room = cont.payload_room(kind)?;
    if slot > room {
        return Err(Img3Error::SizeMismatch { expected: room, actual: slot });
    }
    cont.overwrite_payload(kind, ciphertext)
}

/// Decrypts (and decompresses) the payload of `kind`.
///
/// # Errors
/// Returns an error if the section is missing, or decryption or decompression fails
pub fn decrypt_payload(cont: &Container, kind: SectionKind, key: &AesKey) -> Result<Plaintext> {
    let sect = cont
        .get_section(kind)
        .ok_or(Img3Error::SectionNotFound(kind.name()))?;
    let window = cont
        .payload_window(kind)
        .ok_or(Img3Error::SectionNotFound(kind.name()))?;
    let plain = decrypt_section(window, try_cast!(sect.header.data_len, usize)?, key)?;
    maybe_decompress(plain)
}

/// Runs the whole patch cycle over the DATA section of an image and returns the new image.
///
/// # Errors
/// Returns an error if any step fails, the source buffer is never touched
pub fn patch_image(buf: &[u8], key: &AesKey, patches: &[Patch]) -> Result<Vec<u8>> {
    let mut cont = Container::from_bytes(buf)?;
    let mut plain = decrypt_payload(&cont, SectionKind::Data, key)?;
    if !plain.checksum_matched {
        warn!("Continuing with a payload whose checksum does not match");
    }

    let applied = apply_patches(&mut plain.data, patches);
    info!("Applied {applied} of {} patches", patches.len());

    let packed = maybe_recompress(&plain.data, plain.compressed)?;
    let enc = encrypt_section(&packed, key)?;
    commit(&mut cont, SectionKind::Data, enc)?;
    cont.to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> AesKey {
        AesKey::new(&[0x42; 32], &[0x24; 16]).unwrap()
    }

    #[test]
    fn reads_patch_lines() {
        let patches = parse_patches("0x10 0xdeadbeef\n  20 1  trailing\nC0FFEE 0X2\n\n40 50\n");
        assert_eq!(
            patches,
            [
                Patch { address: 0x10, value: 0xDEAD_BEEF },
                Patch { address: 0x20, value: 1 },
                Patch { address: 0xC0_FFEE, value: 2 },
            ]
        );
        assert!(parse_patches("zz 10\n10 20\n").is_empty());
        assert!(parse_patches("10\n").is_empty());
    }

    #[test]
    fn patch_boundaries() {
        let mut bytes = vec![0u8; 16];
        let patches = [
            Patch { address: 16, value: 1 },
            Patch { address: 17, value: 1 },
            Patch { address: 13, value: 1 },
            Patch { address: u32::MAX, value: 1 },
            Patch { address: 12, value: 0x1122_3344 },
        ];
        assert_eq!(apply_patches(&mut bytes, &patches), 1);
        assert_eq!(&bytes[12..], &0x1122_3344u32.to_ne_bytes());
        assert!(bytes[..12].iter().all(|&b| b == 0));
    }

    #[test]
    fn later_patches_win() {
        let mut bytes = vec![0u8; 8];
        let patches = [Patch { address: 0, value: 1 }, Patch { address: 2, value: 0xFFFF_FFFF }];
        assert_eq!(apply_patches(&mut bytes, &patches), 2);
        let mut expected = [0u8; 8];
        expected[..4].copy_from_slice(&1u32.to_ne_bytes());
        expected[2..6].copy_from_slice(&[0xFF; 4]);
        assert_eq!(bytes, expected);
    }

    #[test]
    fn decrypt_reads_past_declared_length() {
        let plain: Vec<u8> = (0..32).collect();
        let enc = key().encrypt(&plain).unwrap();
        // declared 20 bytes, the rest of the second block is still in the window
        let out = decrypt_section(&enc, 20, &key()).unwrap();
        assert_eq!(out, plain);
    }

    #[test]
    fn decrypt_zero_fills_short_window() {
        let enc = key().encrypt(&[3; 16]).unwrap();
        let mut window = enc.clone();
        window.extend_from_slice(&[0; 4]);
        let out = decrypt_section(&window, 20, &key()).unwrap();
        assert_eq!(out.len(), 32);
        assert_eq!(&out[..16], &[3; 16]);
        assert!(matches!(
            decrypt_section(&enc, 20, &key()),
            Err(Img3Error::Truncated { .. })
        ));
    }

    #[test]
    fn encrypt_pads_with_zeroes() {
        let enc = encrypt_section(&[9; 17], &key()).unwrap();
        assert_eq!(enc.len(), 32);
        let dec = key().decrypt(&enc).unwrap();
        assert_eq!(&dec[..17], &[9; 17]);
        assert!(dec[17..].iter().all(|&b| b == 0));
    }

    #[test]
    fn plain_payload_passes_through() {
        let plain = maybe_decompress(vec![1, 2, 3]).unwrap();
        assert!(!plain.compressed);
        assert_eq!(plain.data, [1, 2, 3]);
        assert_eq!(maybe_recompress(&plain.data, false).unwrap(), [1, 2, 3]);
    }

    #[test]
    fn compressed_payload_is_expanded() {
        let data = b"kernelcache kernelcache kernelcache".repeat(20);
        let packed = lzss::compress(&data).unwrap();
        let plain = maybe_decompress(packed).unwrap();
        assert!(plain.compressed);
        assert!(plain.checksum_matched);
        assert_eq!(plain.data, data);
    }
}
