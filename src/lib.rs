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

//clippy config
#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,  // Img3Error in error, ZipArchive in zip
    clippy::must_use_candidate        // the getters already carry it where it matters
)]

use clap::{Parser, Subcommand};

#[macro_use]
pub mod utils;
pub mod error;
pub mod lzss;
pub mod img3;
pub mod crypto;
pub mod pipeline;
pub mod zip;
pub mod keystore;
pub mod wiki;
pub mod ops;

#[derive(Parser, Debug, Clone)]
#[clap(author="@plzdonthaxme", version="0.1", about="An IMG3 decrypter, LZSS codec and kernelcache patcher, made in Rust", disable_version_flag=true)]
pub struct Args {
    #[clap(long, global=true, default_value="img3_keys.plist", help="Key store to read keys from and update", value_name="FILE")]
    pub db: String,
    #[clap(short='V', long, global=true, help="Print debug output")]
    pub verbose: bool,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Decrypt (and decompress) one kind of file inside an ipsw, or a single image
    Decrypt {
        #[clap(short='d', help="Device name, inferred from the file name if missing")]
        device: Option<String>,
        #[clap(short='v', help="Firmware version, inferred from the file name if missing")]
        version: Option<String>,
        #[clap(short='s', help="Section to decrypt, e.g. kernelcache or ibss (case-insensitive)")]
        section: String,
        #[clap(short='o', help="Output filename", value_name="OUTPUT")]
        output: Option<String>,
        #[clap(help="ipsw or image file", value_name="INPUT")]
        input: String,
    },
    /// Store the keys from a saved key wiki page
    Update {
        #[clap(short='d', help="Device name, inferred from the page name if missing")]
        device: Option<String>,
        #[clap(short='b', help="Firmware build, inferred from the page name if missing")]
        build: Option<String>,
        #[clap(short='v', help="Firmware version")]
        version: String,
        #[clap(help="Saved HTML page", value_name="PAGE")]
        page: String,
    },
    /// List the files inside an ipsw
    List {
        #[clap(help="ipsw file", value_name="INPUT")]
        input: String,
    },
    /// Extract one kind of file, or everything, from an ipsw
    Extract {
        #[clap(short='s', help="Only extract entries containing this name (case-insensitive)")]
        section: Option<String>,
        #[clap(help="ipsw file", value_name="INPUT")]
        input: String,
    },
    /// Patch the kernelcache inside an ipsw, or a single kernelcache image
    Patch {
        #[clap(short='d', help="Device name, inferred from the file name if missing")]
        device: Option<String>,
        #[clap(short='v', help="Firmware version, inferred from the file name if missing")]
        version: Option<String>,
        #[clap(short='o', help="Output filename", value_name="OUTPUT")]
        output: Option<String>,
        #[clap(help="Patch file with one \"<address> <value>\" pair per line", value_name="PATCH_FILE")]
        patch_file: String,
        #[clap(help="ipsw or kernelcache file", value_name="INPUT")]
        input: String,
    },
    /// List the sections of an image
    Parse {
        #[clap(help="Image file", value_name="INPUT")]
        input: String,
    },
    /// Decompress a raw LZSS file
    Decompress {
        #[clap(short='o', help="Output filename", value_name="OUTPUT")]
        output: Option<String>,
        #[clap(help="Compressed file", value_name="INPUT")]
        input: String,
    },
}
