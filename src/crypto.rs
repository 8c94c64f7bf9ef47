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
    crate::utils::{round_up16, Img3Error, Result, AES_BLOCK_SIZE},
    openssl::symm::{Cipher, Crypter, Mode},
    std::fmt,
};

/// AES-CBC key and IV, without any padding handled by openssl.
#[derive(Clone, PartialEq, Eq)]
pub struct AesKey {
    key: Vec<u8>,
    iv: [u8; AES_BLOCK_SIZE],
}

// keys are not printed in full
impl fmt::Debug for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AesKey(AES{}, iv: {})", self.key.len() * 8, hex::encode(self.iv))
    }
}

impl AesKey {
    /// # Errors
    /// Returns an error if the key is not 16, 24 or 32 bytes or the IV is not 16 bytes
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self> {
        if ![16, 24, 32].contains(&key.len()) {
            return Err(Img3Error::InvalidKeyMaterial(format!(
                "key is {} bytes, expected 16, 24 or 32",
                key.len()
            )));
        }
        let iv = iv.try_into().map_err(|_| {
            Img3Error::InvalidKeyMaterial(format!("iv is {} bytes, expected 16", iv.len()))
        })?;
        Ok(Self { key: key.to_vec(), iv })
    }

    /// # Errors
    /// Returns an error if either string is not hex or has the wrong length
    pub fn from_hex(key: &str, iv: &str) -> Result<Self> {
        let key_bytes = hex::decode(key.trim())
            .map_err(|e| Img3Error::InvalidKeyMaterial(format!("key: {e}")))?;
        let iv_bytes = hex::decode(iv.trim())
            .map_err(|e| Img3Error::InvalidKeyMaterial(format!("iv: {e}")))?;
        Self::new(&key_bytes, &iv_bytes)
    }

    fn cipher(&self) -> Cipher {
        match self.key.len() {
            16 => Cipher::aes_128_cbc(),
            24 => Cipher::aes_192_cbc(),
            _ => Cipher::aes_256_cbc(),
        }
    }

    /// # Errors
    /// Returns an error if `data` is not block aligned or openssl fails
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.crypt(Mode::Decrypt, data)
    }

    /// # Errors
    /// Returns an error if `data` is not block aligned or openssl fails
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.crypt(Mode::Encrypt, data)
    }

    fn crypt(&self, mode: Mode, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() % AES_BLOCK_SIZE != 0 {
            return Err(Img3Error::SizeMismatch {
                expected: round_up16(data.len()),
                actual: data.len(),
            });
        }
        let cipher = self.cipher();
        let mut crypter = Crypter::new(cipher, mode, &self.key, Some(&self.iv))?;
        crypter.pad(false);
        let mut buf = vec![0; data.len() + cipher.block_size()];
        let count = crypter.update(data, &mut buf)?;
        let rest = crypter.finalize(&mut buf[count..])?;
        buf.truncate(count + rest);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IV: &str = "000102030405060708090a0b0c0d0e0f";
    const PLAIN: &str = "6bc1bee22e409f96e93d7e117393172a";

    #[test]
    fn cbc_reference_vectors() {
        let key = AesKey::from_hex(
            "603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4",
            IV,
        )
        .unwrap();
        let plain = hex::decode(PLAIN).unwrap();
        let enc = key.encrypt(&plain).unwrap();
        assert_eq!(hex::encode(&enc), "f58c4c04d6e5f1ba779eabfb5f7bfbd6");
        assert_eq!(key.decrypt(&enc).unwrap(), plain);

        let key = AesKey::from_hex("2b7e151628aed2a6abf7158809cf4f3c", IV).unwrap();
        assert_eq!(
            hex::encode(key.encrypt(&plain).unwrap()),
            "7649abac8119b246cee98e9b12e9197d"
        );
    }

    #[test]
    fn no_padding_block_is_added() {
        let key = AesKey::new(&[7; 32], &[1; 16]).unwrap();
        let data = vec![0x5A; 64];
        let enc = key.encrypt(&data).unwrap();
        assert_eq!(enc.len(), 64);
        assert_eq!(key.decrypt(&enc).unwrap(), data);
    }

    #[test]
    fn rejects_bad_material() {
        assert!(matches!(AesKey::from_hex("abcd", IV), Err(Img3Error::InvalidKeyMaterial(_))));
        assert!(matches!(AesKey::from_hex(&"00".repeat(32), "0011"), Err(Img3Error::InvalidKeyMaterial(_))));
        assert!(matches!(AesKey::from_hex("zz", IV), Err(Img3Error::InvalidKeyMaterial(_))));
        assert!(AesKey::from_hex(&"00".repeat(24), IV).is_ok());
    }

    #[test]
    fn unaligned_input_is_refused() {
        let key = AesKey::new(&[0; 16], &[0; 16]).unwrap();
        assert!(matches!(key.encrypt(&[0; 15]), Err(Img3Error::SizeMismatch { expected: 16, actual: 15 })));
    }
}
