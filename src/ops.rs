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

//! The top level commands. Each one reads its inputs, runs to completion and
//! only writes its outputs once everything before has succeeded.

use {
    crate::{
        img3::{Container, SectionKind},
        keystore::KeyStore,
        lzss,
        pipeline,
        utils::{write_file, Colorize, Img3Error, Result},
        wiki,
        zip::ZipArchive,
    },
    lazy_static::lazy_static,
    log::{info, warn},
    std::{collections::HashMap, fs, path::Path},
};

pub const PATCH_SECTION: &str = "kernelcache";

lazy_static! {
    // models whose key pages use a marketing name instead of the model prefix
    static ref DEVICE_NAMES: HashMap<&'static str, &'static str> = vec![
        ("iPhone1,1", "iPhone"),
        ("iPhone1,2", "iPhone_3"),
        ("iPhone2,1", "iPhone_3GS"),
        ("iPhone3,1", "iPhone_4"),
    ]
    .into_iter()
    .collect();
}

fn file_name(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}

/// Device name from an ipsw name such as `iPhone2,1_3.1.3_7E18_Restore.ipsw`.
///
/// # Errors
/// Returns an error if the name carries no model identifier
pub fn infer_device(path: &str) -> Result<String> {
    let name = file_name(path);
    let known = DEVICE_NAMES
        .iter()
        .filter(|(model, _)| name.contains(**model))
        .map(|(_, device)| *device)
        .min();
    if let Some(device) = known {
        return Ok(device.to_string());
    }
    name.split_once(',')
        .map(|(device, _)| device.to_string())
        .ok_or(Img3Error::Inference("device"))
}

/// Version between the first two underscores of an ipsw name.
///
/// # Errors
/// Returns an error if there are fewer than two underscores
pub fn infer_version(path: &str) -> Result<String> {
    let mut parts = file_name(path).split('_');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(version), Some(_)) if !version.is_empty() => Ok(version.to_string()),
        _ => Err(Img3Error::Inference("version")),
    }
}

/// Device from a saved key page name, `<build> (<...>)...=<device>_(...)`.
///
/// # Errors
/// Returns an error if there is no `=` followed by a `(`
pub fn infer_page_device(path: &str) -> Result<String> {
    let name = file_name(path);
    let (_, after) = name.split_once('=').ok_or(Img3Error::Inference("device"))?;
    let (device, _) = after.split_once('(').ok_or(Img3Error::Inference("device"))?;
    let device = device.strip_suffix('_').unwrap_or(device);
    if device.is_empty() {
        return Err(Img3Error::Inference("device"));
    }
    Ok(device.to_string())
}

/// Build from a saved key page name, everything before the first `(`.
///
/// # Errors
/// Returns an error if there is no `(`
pub fn infer_page_build(path: &str) -> Result<String> {
    let (build, _) = file_name(path).split_once('(').ok_or(Img3Error::Inference("build"))?;
    let build = build.trim_end();
    if build.is_empty() {
        return Err(Img3Error::Inference("build"));
    }
    Ok(build.to_string())
}

/// Fills in whatever of device and version was not given from the ipsw name.
///
/// # Errors
/// Returns an error if a missing value cannot be inferred
pub fn resolve_target(input: &str, device: Option<&str>, version: Option<&str>) -> Result<(String, String)> {
    let device = match device {
        Some(d) => d.to_string(),
        None => infer_device(input)?,
    };
    let version = match version {
        Some(v) => v.to_string(),
        None => infer_version(input)?,
    };
    info!("Using device {device} with version {version}");
    Ok((device, version))
}

#[must_use]
pub fn output_name(input: &str, suffix: &str) -> String {
    format!("{input}_{suffix}")
}

// the entries of an archive matching `filter`, or the input itself when it is a plain image
fn collect_inputs(input: &str, filter: &str) -> Result<Vec<String>> {
    info!("Analyzing archive file {input}");
    match ZipArchive::analyze(input) {
        Ok(zip) => {
            info!("Extracting all files for section {filter}");
            Ok(zip
                .extract_matching(filter)?
                .into_iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect())
        }
        Err(Img3Error::NotAZipArchive(_)) => {
            info!("{input} is not an archive, treating it as an image");
            Ok(vec![input.to_string()])
        }
        Err(e) => Err(e),
    }
}

// an explicit output name only makes sense for a single file
fn pick_output(file: &str, output: Option<&str>, count: usize, suffix: &str) -> String {
    match output {
        Some(out) if count == 1 => out.to_string(),
        Some(out) => {
            warn!("Ignoring output name {out}, {count} files matched");
            output_name(file, suffix)
        }
        None => output_name(file, suffix),
    }
}

/// Decrypts (and decompresses) the DATA section of every matching file.
///
/// # Errors
/// Returns an error on the first file that cannot be read, has no keys or fails to decrypt
pub fn decrypt(
    store: &mut impl KeyStore,
    input: &str,
    device: &str,
    version: &str,
    section: &str,
    output: Option<&str>,
) -> Result<Vec<String>> {
    let section = section.to_lowercase();
    let files = collect_inputs(input, &section)?;
    let mut written = Vec::with_capacity(files.len());

    for file in &files {
        info!("Reading {file}");
        let cont = Container::from_bytes(&fs::read(file)?)?;
        let key = store.lookup(device, version, &section)?;
        let plain = pipeline::decrypt_payload(&cont, SectionKind::Data, &key)?;
        if !plain.checksum_matched {
            println!("{}", "Checksum mismatch, the output may still be usable".yellow());
        }

        let out = pick_output(file, output, files.len(), "decrypted");
        write_file(&out, &plain.data)?;
        println!("Decrypted {file} to {}", out.green());
        written.push(out);
    }
    Ok(written)
}

/// Applies a patch file to every kernelcache found in `input`.
///
/// # Errors
/// Returns an error if a file cannot be read, has no keys, or the repacked
/// section no longer fits
pub fn patch(
    store: &mut impl KeyStore,
    patch_file: &str,
    input: &str,
    device: &str,
    version: &str,
    output: Option<&str>,
) -> Result<Vec<String>> {
    info!("Patching with file {patch_file}");
    let patches = pipeline::read_patch_file(patch_file)?;
    if patches.is_empty() {
        warn!("{patch_file} has no patches, the image will only be repacked");
    }

    let files = collect_inputs(input, PATCH_SECTION)?;
    let mut written = Vec::with_capacity(files.len());
    for file in &files {
        info!("Reading {file}");
        let buf = fs::read(file)?;
        let key = store.lookup(device, version, PATCH_SECTION)?;
        let patched = pipeline::patch_image(&buf, &key, &patches)?;

        let out = pick_output(file, output, files.len(), "patched");
        write_file(&out, &patched)?;
        println!("Patched {file} to {}", out.green());
        written.push(out);
    }
    Ok(written)
}

/// # Errors
/// Returns an error if `input` is not a readable archive
pub fn list(input: &str) -> Result<Vec<String>> {
    let zip = ZipArchive::analyze(input)?;
    println!("Found the following files in the archive {input}:");
    for entry in zip.entries() {
        println!("\t{entry}");
    }
    Ok(zip.entries().to_vec())
}

/// Extracts the entries matching `section`, or everything.
///
/// # Errors
/// Returns an error if `input` is not a readable archive or `unzip` fails
pub fn extract(input: &str, section: Option<&str>) -> Result<()> {
    let zip = ZipArchive::analyze(input)?;
    match section {
        Some(section) => {
            let files = zip.extract_matching(section)?;
            if files.is_empty() {
                warn!("No entries of {input} match {section}");
            }
            for f in files {
                println!("Extracted {}", f.display().to_string().green());
            }
        }
        None => zip.extract_all()?,
    }
    Ok(())
}

/// Scrapes a saved key page and stores its keys.
///
/// # Errors
/// Returns an error if the page has no keys or the store cannot be written
pub fn update(
    store: &mut impl KeyStore,
    page: &str,
    device: &str,
    build: &str,
    version: &str,
) -> Result<usize> {
    let html = fs::read(page)?;
    let infos = wiki::scrape(&String::from_utf8_lossy(&html));
    if infos.is_empty() {
        return Err(Img3Error::Scrape("no key lists found on the page"));
    }
    println!("Updating keys for {device} {version} ({build})");
    for info in &infos {
        println!("\t{}", info.section);
    }
    store.upsert(device, build, version, &infos)?;
    println!("{}", "Completed key store update".green());
    Ok(infos.len())
}

/// # Errors
/// Returns an error if the file is not a well formed image
pub fn parse(input: &str) -> Result<Container> {
    println!("Parsing file {input}");
    let cont = Container::from_bytes(&fs::read(input)?)?;
    cont.print_sections();
    Ok(cont)
}

/// Decompresses a raw LZSS file.
///
/// # Errors
/// Returns `NotCompressed` if the file has no LZSS header
pub fn decompress(input: &str, output: Option<&str>) -> Result<String> {
    let buf = fs::read(input)?;
    if !lzss::is_compressed(&buf) {
        return Err(Img3Error::NotCompressed);
    }
    println!("Decompressing {:#x} bytes from {input}", buf.len());
    let out = lzss::decompress(&buf)?;
    if !out.checksum_matched {
        println!("{}", "Checksum mismatch, the output may still be usable".yellow());
    }
    let name = output.map_or_else(|| output_name(input, "decompressed"), str::to_string);
    write_file(&name, &out.data)?;
    println!("Decompressed to {}", name.green());
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_from_ipsw_name() {
        assert_eq!(infer_device("iPhone1,1_3.1.3_7E18_Restore.ipsw").unwrap(), "iPhone");
        assert_eq!(infer_device("/tmp/iPhone1,2_4.2.1_8C148_Restore.ipsw").unwrap(), "iPhone_3");
        assert_eq!(infer_device("iPhone2,1_5.0_9A334_Restore.ipsw").unwrap(), "iPhone_3GS");
        assert_eq!(infer_device("iPhone3,1_4.0_8A293_Restore.ipsw").unwrap(), "iPhone_4");
        assert_eq!(infer_device("iPod2,1_4.2.1_8C148_Restore.ipsw").unwrap(), "iPod2");
        assert!(matches!(infer_device("kernelcache.release.n82"), Err(Img3Error::Inference("device"))));
    }

    #[test]
    fn version_from_ipsw_name() {
        assert_eq!(infer_version("iPhone2,1_3.1.3_7E18_Restore.ipsw").unwrap(), "3.1.3");
        assert_eq!(infer_version("dir_with_underscores/iPhone1,1_3.0_7A341_Restore.ipsw").unwrap(), "3.0");
        assert!(infer_version("iPhone2,1_3.1.3").is_err());
        assert!(infer_version("a__b").is_err());
    }

    #[test]
    fn target_from_page_name() {
        let page = "7E18 (iPhone 3GS) - The iPhone Wiki=iPhone_3GS_(7E18).html";
        assert_eq!(infer_page_device(page).unwrap(), "iPhone_3GS");
        assert_eq!(infer_page_build(page).unwrap(), "7E18");
        assert!(infer_page_device("7E18.html").is_err());
        assert!(infer_page_build("7E18.html").is_err());
        assert!(infer_page_build("(7E18).html").is_err());
    }

    #[test]
    fn output_names() {
        assert_eq!(output_name("kernelcache.release.n82", "patched"), "kernelcache.release.n82_patched");
        assert_eq!(pick_output("a", Some("b"), 1, "decrypted"), "b");
        assert_eq!(pick_output("a", Some("b"), 2, "decrypted"), "a_decrypted");
        assert_eq!(pick_output("a", None, 1, "decrypted"), "a_decrypted");
    }
}
