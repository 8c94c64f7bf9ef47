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

use thiserror::Error;

/// Everything that can go wrong while reading, rewriting or repacking an image.
///
/// A checksum mismatch in an LZSS stream is deliberately absent: it is logged
/// and reported through [`crate::lzss::Decompressed::checksum_matched`].
#[derive(Debug, Error)]
pub enum Img3Error {
    // container parsing
    #[error("not an IMG3 file, first magic is {0:#010x}")]
    InvalidFormat(u32),
    #[error("IMG3 length mismatch, header says {expected:#x} bytes but the file is {actual:#x} bytes")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("{what} truncated at offset {offset:#x}")]
    Truncated { what: &'static str, offset: usize },
    #[error("section {tag} at offset {offset:#x} is malformed: {reason}")]
    InvalidSection { tag: String, offset: usize, reason: &'static str },

    // lzss
    #[error("input size {0:#x} is too small to hold an LZSS header")]
    InputTooSmall(usize),
    #[error("data is not LZSS compressed")]
    NotCompressed,
    #[error("LZSS compression failed: {0}")]
    CompressionFailed(&'static str),
    #[error("LZSS header claims {uncompressed:#x} bytes from {compressed:#x} compressed bytes")]
    ExpansionTooLarge { uncompressed: usize, compressed: usize },

    // lookups
    #[error("no {0} section found")]
    SectionNotFound(&'static str),
    #[error("no key and iv for {device} with version {version} and section {section}")]
    KeyNotFound { device: String, version: String, section: String },

    // pipeline
    #[error("size mismatch, expected {expected:#x} bytes but got {actual:#x}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),
    #[error("openssl error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    // archives
    #[error("{0} is not a zip archive")]
    NotAZipArchive(String),
    #[error("malformed zip archive: {0}")]
    Archive(String),
    #[error("unzip failed for {archive}: {reason}")]
    ExtractionFailed { archive: String, reason: String },

    // key store and scraper
    #[error("key store error: {0}")]
    KeyStore(#[from] plist::Error),
    #[error("malformed key store: {0}")]
    KeyStoreFormat(String),
    #[error("unable to scrape keys: {0}")]
    Scrape(&'static str),

    #[error("value does not fit in {0}")]
    Overflow(&'static str),

    // command line
    #[error("unable to infer the {0} from the file name, specify it explicitly")]
    Inference(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("binary read error: {0}")]
    Binary(#[from] binrw::Error),
}

pub type Result<T> = std::result::Result<T, Img3Error>;
