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

//! Just enough of the zip format to list an ipsw, extraction is left to `unzip`.

use {
    crate::utils::{binrw, BinReaderExt, Cursor, Img3Error, Result},
    log::{debug, info},
    memchr::memmem,
    std::{
        fs::File,
        io::{Read, Seek, SeekFrom},
        path::{Path, PathBuf},
        process::Command,
    },
};

const EOCD_MAGIC: &[u8; 4] = b"PK\x05\x06";
const CDIR_MAGIC: u32 = 0x0201_4B50;
const EOCD_LEN: usize = 22;
const CDIR_ENTRY_LEN: usize = 46;
// the end of central directory record has to be in here
const EOCD_SEARCH_LEN: u64 = 1024;

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndOfCentralDir {
    pub magic: u32,
    pub disk: u16,
    pub cdir_disk: u16,
    pub disk_entries: u16,
    pub total_entries: u16,
    pub cdir_size: u32,
    pub cdir_offset: u32,
    pub comment_len: u16,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CentralDirEntry {
    pub magic: u32,
    pub made_by: u16,
    pub needed: u16,
    pub flags: u16,
    pub method: u16,
    pub mtime: u16,
    pub mdate: u16,
    pub crc32: u32,
    pub comp_size: u32,
    pub uncomp_size: u32,
    pub name_len: u16,
    pub extra_len: u16,
    pub comment_len: u16,
    pub disk_start: u16,
    pub int_attr: u16,
    pub ext_attr: u32,
    pub local_offset: u32,
    #[br(count = name_len)]
    pub name: Vec<u8>,
    #[br(count = extra_len)]
    pub extra: Vec<u8>,
    #[br(count = comment_len)]
    pub comment: Vec<u8>,
}

/// Finds the end of central directory record in the tail of a file.
///
/// # Errors
/// Returns an error if there is no record, or it is cut off
pub fn find_eocd(tail: &[u8]) -> Result<EndOfCentralDir> {
    let pos = memmem::rfind(tail, EOCD_MAGIC)
        .ok_or_else(|| Img3Error::NotAZipArchive(String::from("input")))?;
    if tail.len() - pos < EOCD_LEN {
        return Err(Img3Error::Archive(String::from("end of central directory is truncated")));
    }
    cast_struct!(EndOfCentralDir, &tail[pos..pos + EOCD_LEN])
}

/// # Errors
/// Returns an error if a record is missing its magic or runs past the directory
pub fn parse_central_dir(cdir: &[u8], count: u16) -> Result<Vec<String>> {
    let mut cur = Cursor::new(cdir);
    let mut names = Vec::with_capacity(count.into());
    for i in 0..count {
        let pos = usize::try_from(cur.position()).map_err(|_| Img3Error::Overflow("usize"))?;
        if cdir.len() - pos < CDIR_ENTRY_LEN {
            return Err(Img3Error::Archive(format!("central directory ends before entry {i}")));
        }
        let entry = cur
            .read_le::<CentralDirEntry>()
            .map_err(|e| Img3Error::Archive(format!("entry {i} at {pos:#x}: {e}")))?;
        if entry.magic != CDIR_MAGIC {
            return Err(Img3Error::Archive(format!(
                "entry {i} at {pos:#x} has magic {:#010x}",
                entry.magic
            )));
        }
        names.push(String::from_utf8_lossy(&entry.name).into_owned());
    }
    Ok(names)
}

#[derive(Debug, Clone)]
pub struct ZipArchive {
    path: PathBuf,
    entries: Vec<String>,
}

impl ZipArchive {
    /// Lists the entries of an archive from its central directory.
    ///
    /// # Errors
    /// Returns `NotAZipArchive` if there is no end of central directory record in the
    /// last 1024 bytes, or another error if the directory cannot be read
    pub fn analyze(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let size = file.metadata()?.len();

        let tail_len = size.min(EOCD_SEARCH_LEN);
        file.seek(SeekFrom::Start(size - tail_len))?;
        let mut tail = Vec::new();
        file.by_ref().take(tail_len).read_to_end(&mut tail)?;

        let eocd = find_eocd(&tail).map_err(|e| match e {
            Img3Error::NotAZipArchive(_) => Img3Error::NotAZipArchive(path.display().to_string()),
            e => e,
        })?;
        debug!(
            "Central directory of {} has {} entries at {:#x}",
            path.display(),
            eocd.total_entries,
            eocd.cdir_offset
        );

        if u64::from(eocd.cdir_offset) + u64::from(eocd.cdir_size) > size {
            return Err(Img3Error::Archive(String::from("central directory runs past the end of the file")));
        }
        file.seek(SeekFrom::Start(eocd.cdir_offset.into()))?;
        let mut cdir = Vec::new();
        file.take(eocd.cdir_size.into()).read_to_end(&mut cdir)?;

        Ok(Self {
            path: path.to_path_buf(),
            entries: parse_central_dir(&cdir, eocd.total_entries)?,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Entries whose name contains `filter`, ignoring case.
    #[must_use]
    pub fn matching(&self, filter: &str) -> Vec<&str> {
        let filter = filter.to_lowercase();
        self.entries
            .iter()
            .filter(|e| e.to_lowercase().contains(&filter))
            .map(String::as_str)
            .collect()
    }

    /// Extracts every matching entry into the current directory.
    ///
    /// # Errors
    /// Returns an error if `unzip` cannot be run or fails for any entry
    pub fn extract_matching(&self, filter: &str) -> Result<Vec<PathBuf>> {
        let mut extracted = Vec::new();
        for name in self.matching(filter) {
            info!("Extracting {name}");
            self.unzip(&["-o", "-q"], Some(name))?;
            extracted.push(PathBuf::from(name));
        }
        Ok(extracted)
    }

    /// # Errors
    /// Returns an error if `unzip` cannot be run or fails
    pub fn extract_all(&self) -> Result<()> {
        info!("Extracting all of {}", self.path.display());
        self.unzip(&["-q"], None)
    }

    fn unzip(&self, flags: &[&str], entry: Option<&str>) -> Result<()> {
        let mut cmd = Command::new("unzip");
        cmd.args(flags).arg(&self.path);
        if let Some(entry) = entry {
            cmd.arg(entry);
        }
        let status = cmd.status().map_err(|e| Img3Error::ExtractionFailed {
            archive: self.path.display().to_string(),
            reason: e.to_string(),
        })?;
        if !status.success() {
            return Err(Img3Error::ExtractionFailed {
                archive: self.path.display().to_string(),
                reason: status.to_string(),
            });
        }
        Ok(())
    }
}
