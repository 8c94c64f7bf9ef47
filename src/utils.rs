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

pub use {
    crate::error::{Img3Error, Result},
    binrw::{binrw, io::Cursor, BinRead, BinReaderExt, BinWrite},
    byteorder::{ByteOrder, LittleEndian},
    colored::Colorize,
    std::{fmt, fs, ops::Range, path::Path},
};

//utility macros

//checked cast to type, returning an overflow error if unable to do so
#[macro_export]
macro_rules! try_cast {
    ($e: expr, $t: ty) => {
        TryInto::<$t>::try_into($e)
            .map_err(|_| $crate::error::Img3Error::Overflow(stringify!($t)))
    };
}

//generate a struct from a slice of bytes, using binrw
#[macro_export]
macro_rules! cast_struct {
    ($t: ty, $arr: expr) => {
        Cursor::new($arr)
            .read_le::<$t>()
            .map_err($crate::error::Img3Error::from)
    };
}

//write a binrw struct to a mutable buffer
#[macro_export]
macro_rules! struct_write {
    ($str: expr, $arr: expr) => {
        $str.write(&mut Cursor::new(&mut $arr))
            .map_err($crate::error::Img3Error::from)
    };
}

//utility functions

//write a buffer next to the destination first, then move it into place
/// # Errors
/// Returns an error if the temporary file cannot be written or renamed
pub fn write_file(path: &str, arr: &[u8]) -> Result<()> {
    let tmp = format!("{path}.part");
    fs::write(&tmp, arr)?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Img3Error::Io(e)
    })
}

//create a range from the start and size
#[must_use]
pub const fn range_size(start: usize, size: usize) -> Range<usize> {
    start..start + size
}

//round a length up to the next AES block
#[must_use]
pub const fn round_up16(len: usize) -> usize {
    if len % AES_BLOCK_SIZE == 0 {
        len
    } else {
        len + (AES_BLOCK_SIZE - len % AES_BLOCK_SIZE)
    }
}

//read a little endian word, None if the buffer ends first
#[must_use]
pub fn read_u32_le(buf: &[u8], off: usize) -> Option<u32> {
    buf.get(off..off.checked_add(4)?).map(LittleEndian::read_u32)
}

//make a printable four character code from a magic, which is stored as a big endian string
#[must_use]
pub fn fourcc(magic: u32) -> String {
    magic
        .to_be_bytes()
        .iter()
        .map(|&b| if b.is_ascii_graphic() { char::from(b) } else { '.' })
        .collect()
}

pub const AES_BLOCK_SIZE: usize = 16;

pub const IMG3_TAG_HEADER_LEN: usize = 12;
pub const IMG3_OBJ_HEADER_LEN: usize = 20;

// magics as read from the little endian file, the bytes on disk are reversed
pub const IMG3_MAGIC: u32 = 0x49_6D_67_33; // Img3
pub const IMG3_TAG_DATA: u32 = 0x44_41_54_41; // DATA
pub const IMG3_TAG_VERS: u32 = 0x56_45_52_53; // VERS
pub const IMG3_TAG_SEPO: u32 = 0x53_45_50_4F; // SEPO
pub const IMG3_TAG_SCEP: u32 = 0x53_43_45_50; // SCEP
pub const IMG3_TAG_BORD: u32 = 0x42_4F_52_44; // BORD
pub const IMG3_TAG_BDID: u32 = 0x42_44_49_44; // BDID
pub const IMG3_TAG_SHSH: u32 = 0x53_48_53_48; // SHSH
pub const IMG3_TAG_CERT: u32 = 0x43_45_52_54; // CERT
pub const IMG3_TAG_KBAG: u32 = 0x4B_42_41_47; // KBAG
pub const IMG3_TAG_TYPE: u32 = 0x54_59_50_45; // TYPE
pub const IMG3_TAG_SDOM: u32 = 0x53_44_4F_4D; // SDOM
pub const IMG3_TAG_PROD: u32 = 0x50_52_4F_44; // PROD
pub const IMG3_TAG_CHIP: u32 = 0x43_48_49_50; // CHIP
pub const IMG3_TAG_ECID: u32 = 0x45_43_49_44; // ECID

pub const LZSS_SIGNATURE: u32 = 0x63_6F_6D_70; // comp
pub const LZSS_COMPRESSION_TYPE: u32 = 0x6C_7A_73_73; // lzss
pub const LZSS_HEADER_LEN: usize = 0x180;
pub const LZSS_PADDING_LEN: usize = 0x16C;

#[binrw]
#[brw(little)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IMG3TagHeader {
    pub magic: u32,
    pub total_len: u32,
    pub data_len: u32,
}

impl IMG3TagHeader {
    //distance from the start of the section to its payload
    #[must_use]
    pub const fn header_len(&self) -> u32 {
        self.total_len.wrapping_sub(self.data_len)
    }
}

impl fmt::Display for IMG3TagHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "IMG3 Tag:\n\tTag: {},\n\tTotal Length: {:#x},\n\tData Length: {:#x}",
            fourcc(self.magic),
            self.total_len,
            self.data_len
        )
    }
}

#[binrw]
#[brw(little)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IMG3ObjHeader {
    // these fields are unsigned
    pub magic: u32,
    pub total_len: u32,
    pub data_len: u32,

    // these fields are signed
    pub signed_len: u32,
    pub ident: u32,
    //sections follow
}

impl fmt::Display for IMG3ObjHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "IMG3 Object Header:\n\tMagic: {},\n\tTotal Length: {:#x},\n\tData Length: \
             {:#x},\n\tSigned Length: {:#x},\n\tType: {}",
            fourcc(self.magic),
            self.total_len,
            self.data_len,
            self.signed_len,
            fourcc(self.ident)
        )
    }
}

#[binrw]
#[brw(big)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LZSSHead {
    pub signature: u32,
    pub compression_type: u32,
    pub checksum: u32,
    pub len_uncompressed: u32,
    pub len_compressed: u32,
    #[br(count = LZSS_PADDING_LEN)]
    pub padding: Vec<u8>,
}

impl LZSSHead {
    #[must_use]
    pub fn new(checksum: u32, len_uncompressed: u32, len_compressed: u32) -> Self {
        Self {
            signature: LZSS_SIGNATURE,
            compression_type: LZSS_COMPRESSION_TYPE,
            checksum,
            len_uncompressed,
            len_compressed,
            padding: vec![0; LZSS_PADDING_LEN],
        }
    }
}

impl fmt::Display for LZSSHead {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "LZSS Header:\n\tSignature: {},\n\tType: {},\n\tAdler32: {:#010x},\n\tUncompressed \
             Length: {:#x},\n\tCompressed Length: {:#x}",
            fourcc(self.signature),
            fourcc(self.compression_type),
            self.checksum,
            self.len_uncompressed,
            self.len_compressed
        )
    }
}
