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

mod common;

use {
    common::{encrypted_image, kernel_text, key, le},
    img3patch::{
        error::Img3Error,
        img3::{Container, SectionKind},
        lzss,
        pipeline::{self, Patch},
    },
};

#[test]
fn parses_kernelcache_layout() {
    let img = encrypted_image(&[0x42; 40], &key());
    let cont = Container::from_bytes(&img).unwrap();
    let kinds: Vec<_> = cont.sections().iter().map(|s| s.kind).collect();
    assert_eq!(kinds, [SectionKind::Base, SectionKind::Type, SectionKind::Data, SectionKind::Kbag]);
    assert_eq!(cont.get_section_payload(SectionKind::Type), Some(&b"lnrk"[..]));
    assert_eq!(cont.get_section_payload_length(SectionKind::Data), 40);
    assert_eq!(cont.obj_header().map(|h| h.ident), Some(u32::from_le_bytes(*b"lnrk")));
}

#[test]
fn decrypts_uncompressed_payload() {
    let plain: Vec<u8> = (0..40).collect();
    let img = encrypted_image(&plain, &key());
    let cont = Container::from_bytes(&img).unwrap();
    let out = pipeline::decrypt_payload(&cont, SectionKind::Data, &key()).unwrap();
    assert!(!out.compressed);
    assert_eq!(out.data.len(), 48);
    assert_eq!(&out.data[..40], &plain[..]);
}

#[test]
fn patches_uncompressed_image() {
    let plain = vec![0u8; 40];
    let img = encrypted_image(&plain, &key());
    let patches = [
        Patch { address: 8, value: 0xE320_F000 },
        Patch { address: 0x1000, value: 1 },
    ];
    let patched = pipeline::patch_image(&img, &key(), &patches).unwrap();
    assert_eq!(patched.len(), img.len());

    let cont = Container::from_bytes(&patched).unwrap();
    let out = pipeline::decrypt_payload(&cont, SectionKind::Data, &key()).unwrap();
    assert_eq!(&out.data[8..12], &0xE320_F000u32.to_ne_bytes());
    assert!(out.data[..8].iter().chain(&out.data[12..40]).all(|&b| b == 0));

    // everything around the DATA payload is untouched
    let before = Container::from_bytes(&img).unwrap();
    assert_eq!(
        cont.get_section_payload(SectionKind::Kbag),
        before.get_section_payload(SectionKind::Kbag)
    );
    assert_eq!(&patched[..44], &img[..44]);
}

#[test]
fn compressed_image_survives_a_no_op_patch() {
    let kernel = kernel_text(5000);
    let packed = lzss::compress(&kernel).unwrap();
    let img = encrypted_image(&packed, &key());

    let cont = Container::from_bytes(&img).unwrap();
    let out = pipeline::decrypt_payload(&cont, SectionKind::Data, &key()).unwrap();
    assert!(out.compressed);
    assert!(out.checksum_matched);
    assert_eq!(out.data, kernel);

    // writing back the value already there recompresses to the same stream
    let word = u32::from_ne_bytes(kernel[100..104].try_into().unwrap());
    let patched = pipeline::patch_image(&img, &key(), &[Patch { address: 100, value: word }]).unwrap();
    assert_eq!(patched, img);
}

#[test]
fn resized_payload_is_refused() {
    let img = encrypted_image(&[7; 40], &key());
    let mut cont = Container::from_bytes(&img).unwrap();

    let err = pipeline::commit(&mut cont, SectionKind::Data, vec![0; 64]).unwrap_err();
    assert!(matches!(err, Img3Error::SizeMismatch { expected: 48, actual: 64 }));
    let err = pipeline::commit(&mut cont, SectionKind::Data, vec![0; 32]).unwrap_err();
    assert!(matches!(err, Img3Error::SizeMismatch { expected: 48, actual: 32 }));
    // nothing was written
    assert_eq!(cont.to_bytes().unwrap(), img);

    pipeline::commit(&mut cont, SectionKind::Data, vec![0xAB; 48]).unwrap();
    let out = cont.to_bytes().unwrap();
    assert_eq!(out.len(), img.len());
    assert!(out[48..96].iter().all(|&b| b == 0xAB));
}

#[test]
fn unpadded_data_does_not_overwrite_next_section() {
    // DATA declares 20 bytes and only holds 20, KBAG starts right after it
    let mut body = b"ATAD".to_vec();
    body.extend(le(12 + 20));
    body.extend(le(20));
    body.extend([0x5A; 20]);
    body.extend(b"GABK");
    body.extend(le(12 + 8));
    body.extend(le(8));
    body.extend([0x11; 8]);

    let mut img = b"3gmI".to_vec();
    img.extend(le(20 + body.len()));
    img.extend(le(body.len()));
    img.extend(le(body.len()));
    img.extend(b"lnrk");
    img.extend(&body);

    let cont = Container::from_bytes(&img).unwrap();
    assert_eq!(cont.payload_room(SectionKind::Data).unwrap(), 20);
    assert!(matches!(
        pipeline::patch_image(&img, &key(), &[Patch { address: 0, value: 0xDEAD_BEEF }]),
        Err(Img3Error::SizeMismatch { expected: 20, actual: 32 })
    ));

    let mut cont = Container::from_bytes(&img).unwrap();
    let err = pipeline::commit(&mut cont, SectionKind::Data, vec![0; 32]).unwrap_err();
    assert!(matches!(err, Img3Error::SizeMismatch { expected: 20, actual: 32 }));
    assert_eq!(cont.to_bytes().unwrap(), img);

    cont.overwrite_payload(SectionKind::Data, vec![0; 32]).unwrap();
    assert!(matches!(cont.to_bytes(), Err(Img3Error::SizeMismatch { expected: 20, actual: 32 })));
}

#[test]
fn missing_data_section() {
    let mut img = b"3gmI".to_vec();
    img.extend(28u32.to_le_bytes());
    img.extend(16u32.to_le_bytes());
    img.extend(b"SREV");
    img.extend(16u32.to_le_bytes());
    img.extend(4u32.to_le_bytes());
    img.extend(b"1.0\0");
    assert!(matches!(
        pipeline::patch_image(&img, &key(), &[]),
        Err(Img3Error::SectionNotFound("DATA"))
    ));
}
