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

#![allow(dead_code)]

use img3patch::{crypto::AesKey, utils::round_up16};

pub const KEY_HEX: &str = "5d2d3ab9b4ed10e8f7e86eaab0e8cc6ce3e5b2e3a3dcb6d8a4e01fbc8e3a1f44";
pub const IV_HEX: &str = "0a1b2c3d4e5f60718293a4b5c6d7e8f9";

pub fn key() -> AesKey {
    AesKey::from_hex(KEY_HEX, IV_HEX).unwrap()
}

pub fn le(v: usize) -> [u8; 4] {
    u32::try_from(v).unwrap().to_le_bytes()
}

/// A kernelcache style image: full 20 byte header, TYPE, DATA holding `plain`
/// encrypted and declared as `plain.len()` bytes long, then a KBAG.
pub fn encrypted_image(plain: &[u8], key: &AesKey) -> Vec<u8> {
    let mut padded = plain.to_vec();
    padded.resize(round_up16(plain.len()), 0);
    let enc = key.encrypt(&padded).unwrap();

    let mut body = Vec::new();
    body.extend(b"EPYT");
    body.extend(le(16));
    body.extend(le(4));
    body.extend(b"lnrk");

    body.extend(b"ATAD");
    body.extend(le(12 + enc.len()));
    body.extend(le(plain.len()));
    body.extend(&enc);

    body.extend(b"GABK");
    body.extend(le(12 + 56));
    body.extend(le(56));
    body.extend([0x11; 56]);

    let mut img = b"3gmI".to_vec();
    img.extend(le(20 + body.len()));
    img.extend(le(body.len()));
    img.extend(le(body.len()));
    img.extend(b"lnrk");
    img.extend(body);
    img
}

/// Bytes that compress well but are not all the same.
pub fn kernel_text(len: usize) -> Vec<u8> {
    b"__TEXT __DATA __LINKEDIT mach_kernel IOKit "
        .iter()
        .cycle()
        .take(len)
        .enumerate()
        .map(|(i, &b)| if i % 97 == 0 { (i % 251) as u8 } else { b })
        .collect()
}
