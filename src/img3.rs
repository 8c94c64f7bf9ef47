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

use {
    crate::utils::{
        fourcc, range_size, read_u32_le, BinReaderExt, Colorize, Cursor, IMG3ObjHeader,
        IMG3TagHeader, Img3Error, Result, IMG3_OBJ_HEADER_LEN, IMG3_TAG_HEADER_LEN,
    },
    log::debug,
    phf::phf_map, //static map because I know all the values
    std::fmt,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    Base,
    Data,
    Vers,
    Sepo,
    Scep,
    Bord,
    Bdid,
    Shsh,
    Cert,
    Kbag,
    Type,
    Sdom,
    Prod,
    Chip,
    Ecid,
    Unknown,
}

static SECTION_MAGICS: phf::Map<u32, SectionKind> = phf_map! {
    0x496D_6733u32 => SectionKind::Base,
    0x4441_5441u32 => SectionKind::Data,
    0x5645_5253u32 => SectionKind::Vers,
    0x5345_504Fu32 => SectionKind::Sepo,
    0x5343_4550u32 => SectionKind::Scep,
    0x424F_5244u32 => SectionKind::Bord,
    0x4244_4944u32 => SectionKind::Bdid,
    0x5348_5348u32 => SectionKind::Shsh,
    0x4345_5254u32 => SectionKind::Cert,
    0x4B42_4147u32 => SectionKind::Kbag,
    0x5459_5045u32 => SectionKind::Type,
    0x5344_4F4Du32 => SectionKind::Sdom,
    0x5052_4F44u32 => SectionKind::Prod,
    0x4348_4950u32 => SectionKind::Chip,
    0x4543_4944u32 => SectionKind::Ecid,
};

#[must_use]
pub fn classify(magic: u32) -> SectionKind {
    SECTION_MAGICS
        .get(&magic)
        .copied()
        .unwrap_or(SectionKind::Unknown)
}

impl SectionKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Base => "Img3",
            Self::Data => "DATA",
            Self::Vers => "VERS",
            Self::Sepo => "SEPO",
            Self::Scep => "SCEP",
            Self::Bord => "BORD",
            Self::Bdid => "BDID",
            Self::Shsh => "SHSH",
            Self::Cert => "CERT",
            Self::Kbag => "KBAG",
            Self::Type => "TYPE",
            Self::Sdom => "SDOM",
            Self::Prod => "PROD",
            Self::Chip => "CHIP",
            Self::Ecid => "ECID",
            Self::Unknown => "????",
        }
    }

    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Base => "Image Header",
            Self::Data => "Data",
            Self::Vers => "Version",
            Self::Sepo => "Security Epoch",
            Self::Scep => "Hardware Epoch",
            Self::Bord => "Board Type",
            Self::Bdid => "Board ID",
            Self::Shsh => "Signed Hash",
            Self::Cert => "Certificate Chain",
            Self::Kbag => "Keybag",
            Self::Type => "Type",
            Self::Sdom => "Security Domain",
            Self::Prod => "Production Status",
            Self::Chip => "Chip Type",
            Self::Ecid => "Unique ID",
            Self::Unknown => "Unknown",
        }
    }
}

/// One top level section, with a private copy of its payload.
///
/// The payload of DATA starts right after the 12 byte header, every other
/// section keeps its payload in the last `data_len` bytes. CERT is kept
/// whole, the certificates inside are not split up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub kind: SectionKind,
    pub header: IMG3TagHeader,
    // where the section started in the source buffer
    pub offset: usize,
    pub payload_offset: usize,
    pub payload: Vec<u8>,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} ({}) at {:#x}:\n\tTotal Length: {:#x},\n\tData Length: {:#x}",
            self.kind.name(),
            self.kind.description(),
            self.offset,
            self.header.total_len,
            self.header.data_len
        )
    }
}

#[derive(Debug, Default, Clone)]
pub struct Container {
    raw: Vec<u8>,
    // only present when the image header is the full 20 byte form
    obj_header: Option<IMG3ObjHeader>,
    sections: Vec<Section>,
}

impl Container {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Same as [`Container::parse`]
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut cont = Self::new();
        cont.parse(buf)?;
        Ok(cont)
    }

    /// Replaces whatever was parsed before with the sections of `buf`.
    ///
    /// Bytes that do not start a known section are skipped one at a time.
    ///
    /// # Errors
    /// Returns an error if `buf` does not start with an image header, if the header's
    /// total length is not the length of `buf`, or if a known section has lengths that
    /// cannot be followed
    pub fn parse(&mut self, buf: &[u8]) -> Result<()> {
        self.raw.clear();
        self.obj_header = None;
        self.sections.clear();

        let Some(magic) = read_u32_le(buf, 0) else {
            return Err(Img3Error::Truncated { what: "IMG3 header", offset: 0 });
        };
        if classify(magic) != SectionKind::Base {
            return Err(Img3Error::InvalidFormat(magic));
        }
        if buf.len() < IMG3_TAG_HEADER_LEN {
            return Err(Img3Error::Truncated { what: "IMG3 header", offset: 0 });
        }
        let base = cast_struct!(IMG3TagHeader, &buf[..IMG3_TAG_HEADER_LEN])?;
        let total = try_cast!(base.total_len, usize)?;
        if total != buf.len() {
            return Err(Img3Error::LengthMismatch { expected: total, actual: buf.len() });
        }
        if base.data_len > base.total_len {
            return Err(invalid(&base, 0, "data length exceeds total length"));
        }
        let start = try_cast!(base.header_len(), usize)?;
        if start >= IMG3_OBJ_HEADER_LEN {
            self.obj_header = Some(cast_struct!(IMG3ObjHeader, &buf[..IMG3_OBJ_HEADER_LEN])?);
        }
        self.sections.push(Section {
            kind: SectionKind::Base,
            header: base,
            offset: 0,
            payload_offset: start,
            payload: Vec::new(),
        });

        let mut off = start;
        while off < total {
            let Some(magic) = read_u32_le(buf, off) else { break };
            let kind = classify(magic);
            if matches!(kind, SectionKind::Unknown | SectionKind::Base) {
                off += 1;
                continue;
            }
            if total - off < IMG3_TAG_HEADER_LEN {
                debug!("{} magic at {off:#x} has no room for a header, stopping", kind.name());
                break;
            }
            let head = cast_struct!(IMG3TagHeader, &buf[range_size(off, IMG3_TAG_HEADER_LEN)])?;
            let sect = Self::read_section(buf, kind, head, off)?;
            debug!("Found {} at {off:#x}", kind.name());
            off += try_cast!(head.total_len, usize)?;
            self.sections.push(sect);
        }

        self.raw = buf.to_vec();
        Ok(())
    }

    fn read_section(buf: &[u8], kind: SectionKind, head: IMG3TagHeader, off: usize) -> Result<Section> {
        if try_cast!(head.total_len, usize)? < IMG3_TAG_HEADER_LEN {
            return Err(invalid(&head, off, "total length is smaller than the header"));
        }
        if head.data_len > head.total_len {
            return Err(invalid(&head, off, "data length exceeds total length"));
        }
        let payload_offset = off
            + if kind == SectionKind::Data {
                IMG3_TAG_HEADER_LEN
            } else {
                try_cast!(head.header_len(), usize)?
            };
        let payload = buf
            .get(range_size(payload_offset, try_cast!(head.data_len, usize)?))
            .ok_or_else(|| invalid(&head, off, "payload runs past the end of the file"))?
            .to_vec();
        Ok(Section { kind, header: head, offset: off, payload_offset, payload })
    }

    #[must_use]
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Signed length and identifier, for images with the full header.
    #[must_use]
    pub const fn obj_header(&self) -> Option<&IMG3ObjHeader> {
        self.obj_header.as_ref()
    }

    #[must_use]
    pub fn get_sections(&self, kind: SectionKind) -> Vec<&Section> {
        self.sections.iter().filter(|s| s.kind == kind).collect()
    }

    #[must_use]
    pub fn get_section(&self, kind: SectionKind) -> Option<&Section> {
        self.sections.iter().find(|s| s.kind == kind)
    }

    #[must_use]
    pub fn get_section_payload(&self, kind: SectionKind) -> Option<&[u8]> {
        self.get_section(kind).map(|s| s.payload.as_slice())
    }

    #[must_use]
    pub fn get_section_payload_length(&self, kind: SectionKind) -> u32 {
        self.get_section(kind).map_or(0, |s| s.header.data_len)
    }

    /// Source bytes from the start of a payload to the end of the image,
    /// which may run past the declared payload length.
    #[must_use]
    pub fn payload_window(&self, kind: SectionKind) -> Option<&[u8]> {
        self.get_section(kind)
            .and_then(|s| self.raw.get(s.payload_offset..))
    }

    /// Bytes available for the payload of `kind`, from its start to the end of
    /// its section (or of the image, if the section claims more).
    ///
    /// # Errors
    /// Returns an error if there is no such section
    pub fn payload_room(&self, kind: SectionKind) -> Result<usize> {
        let sect = self
            .get_section(kind)
            .ok_or(Img3Error::SectionNotFound(kind.name()))?;
        self.room_of(sect)
    }

    fn room_of(&self, sect: &Section) -> Result<usize> {
        let end = sect
            .offset
            .saturating_add(try_cast!(sect.header.total_len, usize)?)
            .min(self.raw.len());
        Ok(end.saturating_sub(sect.payload_offset))
    }

    /// Swaps the payload of the first section of `kind`. The length is not
    /// checked here, [`Container::to_bytes`] fails if it no longer fits.
    ///
    /// # Errors
    /// Returns an error if there is no such section
    pub fn overwrite_payload(&mut self, kind: SectionKind, bytes: Vec<u8>) -> Result<()> {
        let sect = self
            .sections
            .iter_mut()
            .find(|s| s.kind == kind)
            .ok_or(Img3Error::SectionNotFound(kind.name()))?;
        sect.payload = bytes;
        Ok(())
    }

    /// Writes every payload back over its original place in a copy of the source image.
    ///
    /// # Errors
    /// Returns an error if a payload runs past the end of its section
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = self.raw.clone();
        for sect in self.sections.iter().filter(|s| s.kind != SectionKind::Base) {
            let room = self.room_of(sect)?;
            if sect.payload.len() > room {
                return Err(Img3Error::SizeMismatch { expected: room, actual: sect.payload.len() });
            }
            out.get_mut(range_size(sect.payload_offset, sect.payload.len()))
                .ok_or(Img3Error::SizeMismatch { expected: room, actual: sect.payload.len() })?
                .copy_from_slice(&sect.payload);
        }
        Ok(out)
    }

    pub fn print_sections(&self) {
        if let Some(head) = &self.obj_header {
            println!("{head}");
        }
        for sect in &self.sections {
            println!("{sect}");
        }
        println!(
            "Found {} sections in {:#x} bytes",
            self.sections.len().to_string().green(),
            self.raw.len()
        );
    }
}

fn invalid(head: &IMG3TagHeader, offset: usize, reason: &'static str) -> Img3Error {
    Img3Error::InvalidSection { tag: fourcc(head.magic), offset, reason }
}
