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
    crate::{
        crypto::AesKey,
        utils::{Img3Error, Result},
    },
    log::{debug, info},
    plist::{Dictionary, Value},
    std::path::{Path, PathBuf},
};

/// Key and IV of one firmware file, as hex strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptionInfo {
    pub section: String,
    pub iv: String,
    pub key: String,
}

pub trait KeyStore {
    /// # Errors
    /// Returns `KeyNotFound` if there is no row for the triple
    fn lookup(&mut self, device: &str, version: &str, section: &str) -> Result<AesKey>;

    /// Stores every record, replacing the key and iv of rows already present.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read or written
    fn upsert(
        &mut self,
        device: &str,
        build: &str,
        version: &str,
        infos: &[DecryptionInfo],
    ) -> Result<()>;
}

const BUILD: &str = "Build";
const VERSION: &str = "Version";
const SECTION: &str = "Section";
const IV: &str = "IV";
const KEY: &str = "Key";

/// Key store kept in a plist, one array of rows per device:
///
/// ```text
/// { "iPhone_3GS": [ { Build, Version, Section, IV, Key }, ... ], ... }
/// ```
#[derive(Debug)]
pub struct PlistKeyStore {
    path: PathBuf,
    tables: Option<Dictionary>,
}

fn row_str<'a>(row: &'a Dictionary, field: &str) -> Option<&'a str> {
    row.get(field).and_then(Value::as_string)
}

impl PlistKeyStore {
    /// The file is only read on first use, and created on the first upsert.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            tables: None,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tables(&mut self) -> Result<&mut Dictionary> {
        if self.tables.is_none() {
            let tables = if self.path.exists() {
                debug!("Opening key store {}", self.path.display());
                Value::from_file(&self.path)?
                    .into_dictionary()
                    .ok_or_else(|| Img3Error::KeyStoreFormat(String::from("root is not a dictionary")))?
            } else {
                debug!("Key store {} does not exist yet", self.path.display());
                Dictionary::new()
            };
            self.tables = Some(tables);
        }
        self.tables
            .as_mut()
            .ok_or_else(|| Img3Error::KeyStoreFormat(String::from("not loaded")))
    }

    fn save(&mut self) -> Result<()> {
        let tables = self.tables()?.clone();
        Value::Dictionary(tables).to_file_xml(&self.path)?;
        Ok(())
    }
}

impl KeyStore for PlistKeyStore {
    fn lookup(&mut self, device: &str, version: &str, section: &str) -> Result<AesKey> {
        let section = section.to_lowercase();
        let not_found = || Img3Error::KeyNotFound {
            device: device.to_string(),
            version: version.to_string(),
            section: section.clone(),
        };

        let rows = self
            .tables()?
            .get(device)
            .and_then(Value::as_array)
            .ok_or_else(not_found)?;
        let row = rows
            .iter()
            .filter_map(Value::as_dictionary)
            .find(|r| {
                row_str(r, VERSION) == Some(version)
                    && row_str(r, SECTION).is_some_and(|s| s.eq_ignore_ascii_case(&section))
            })
            .ok_or_else(not_found)?;

        let (Some(key), Some(iv)) = (row_str(row, KEY), row_str(row, IV)) else {
            return Err(Img3Error::KeyStoreFormat(format!(
                "row for {device} {version} {section} has no key or iv"
            )));
        };
        AesKey::from_hex(key, iv)
    }

    fn upsert(
        &mut self,
        device: &str,
        build: &str,
        version: &str,
        infos: &[DecryptionInfo],
    ) -> Result<()> {
        let tables = self.tables()?;
        if !tables.contains_key(device) {
            tables.insert(device.to_string(), Value::Array(Vec::new()));
        }
        let rows = tables
            .get_mut(device)
            .and_then(Value::as_array_mut)
            .ok_or_else(|| Img3Error::KeyStoreFormat(format!("{device} is not an array")))?;

        for info in infos {
            let section = info.section.to_lowercase();
            let existing = rows.iter_mut().filter_map(Value::as_dictionary_mut).find(|r| {
                row_str(r, VERSION) == Some(version) && row_str(r, SECTION) == Some(section.as_str())
            });
            if let Some(row) = existing {
                debug!("Updating {section} for {device} {version}");
                row.insert(IV.to_string(), Value::String(info.iv.clone()));
                row.insert(KEY.to_string(), Value::String(info.key.clone()));
            } else {
                debug!("Adding {section} for {device} {version}");
                let mut row = Dictionary::new();
                row.insert(BUILD.to_string(), Value::String(build.to_string()));
                row.insert(VERSION.to_string(), Value::String(version.to_string()));
                row.insert(SECTION.to_string(), Value::String(section));
                row.insert(IV.to_string(), Value::String(info.iv.clone()));
                row.insert(KEY.to_string(), Value::String(info.key.clone()));
                rows.push(Value::Dictionary(row));
            }
        }

        self.save()?;
        info!(
            "Stored {} keys for {device} {version} ({build}) in {}",
            infos.len(),
            self.path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(section: &str, byte: u8) -> DecryptionInfo {
        DecryptionInfo {
            section: section.to_string(),
            iv: hex::encode([byte; 16]),
            key: hex::encode([byte; 32]),
        }
    }

    #[test]
    fn missing_store_has_no_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PlistKeyStore::new(dir.path().join("keys.plist"));
        assert!(matches!(
            store.lookup("iPhone_3GS", "3.1.3", "kernelcache"),
            Err(Img3Error::KeyNotFound { .. })
        ));
        assert!(!store.path().exists());
    }

    #[test]
    fn upsert_then_lookup_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.plist");

        let mut store = PlistKeyStore::new(&path);
        store
            .upsert("iPhone_3GS", "7E18", "3.1.3", &[info("KernelCache", 1), info("ibss", 2)])
            .unwrap();

        let mut reopened = PlistKeyStore::new(&path);
        let key = reopened.lookup("iPhone_3GS", "3.1.3", "kernelcache").unwrap();
        assert_eq!(key, AesKey::new(&[1; 32], &[1; 16]).unwrap());
        assert_eq!(
            reopened.lookup("iPhone_3GS", "3.1.3", "IBSS").unwrap(),
            AesKey::new(&[2; 32], &[2; 16]).unwrap()
        );
        assert!(reopened.lookup("iPhone_3GS", "3.1.2", "ibss").is_err());
        assert!(reopened.lookup("iPhone", "3.1.3", "ibss").is_err());
    }

    #[test]
    fn upsert_replaces_existing_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.plist");
        let mut store = PlistKeyStore::new(&path);
        store.upsert("iPhone", "7E18", "3.1.3", &[info("kernelcache", 1)]).unwrap();
        store.upsert("iPhone", "7E18", "3.1.3", &[info("kernelcache", 3)]).unwrap();

        let root = Value::from_file(&path).unwrap().into_dictionary().unwrap();
        let rows = root.get("iPhone").and_then(Value::as_array).unwrap();
        assert_eq!(rows.len(), 1);
        let row = rows[0].as_dictionary().unwrap();
        assert_eq!(row_str(row, BUILD), Some("7E18"));
        assert_eq!(row_str(row, KEY), Some(hex::encode([3u8; 32]).as_str()));
    }

    #[test]
    fn bad_rows_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.plist");
        let mut store = PlistKeyStore::new(&path);
        let bad = DecryptionInfo {
            section: "kernelcache".to_string(),
            iv: "not hex".to_string(),
            key: String::new(),
        };
        store.upsert("iPhone", "5A347", "2.0", &[bad]).unwrap();
        assert!(matches!(
            store.lookup("iPhone", "2.0", "kernelcache"),
            Err(Img3Error::InvalidKeyMaterial(_))
        ));

        std::fs::write(&path, b"<?xml version=\"1.0\"?><plist version=\"1.0\"><string>x</string></plist>").unwrap();
        let mut store = PlistKeyStore::new(&path);
        assert!(matches!(
            store.lookup("iPhone", "2.0", "kernelcache"),
            Err(Img3Error::KeyStoreFormat(_))
        ));
    }
}
