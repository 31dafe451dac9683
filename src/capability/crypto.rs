//! Digest, encoding and decryption primitives for provider scripts.

use aes::Aes128;
use base64::Engine;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use md5::{Digest, Md5};
use sha2::{Sha256, Sha512};

use super::{CapabilityError, Result};

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Hex digest of `data` with `algorithm` (`md5`, `sha256`, `sha512`;
/// case and dashes ignored).
pub fn digest_hex(algorithm: &str, data: &str) -> Result<String> {
    let bytes = data.as_bytes();
    let digest = match algorithm.to_ascii_lowercase().replace('-', "").as_str() {
        "md5" => Md5::digest(bytes).to_vec(),
        "sha256" => Sha256::digest(bytes).to_vec(),
        "sha512" => Sha512::digest(bytes).to_vec(),
        _ => return Err(CapabilityError::UnsupportedAlgorithm(algorithm.to_string())),
    };
    Ok(hex::encode(digest))
}

pub fn base64_encode(data: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(data.as_bytes())
}

/// Decode standard or URL-safe base64, padded or not. Invalid UTF-8 is
/// replaced rather than rejected; scripts mostly decode text.
pub fn base64_decode(data: &str) -> Result<String> {
    let trimmed = data.trim().trim_end_matches('=');
    let bytes = base64::engine::general_purpose::STANDARD_NO_PAD
        .decode(trimmed)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(trimmed))
        .map_err(|e| CapabilityError::Decode(format!("invalid base64: {e}")))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub fn hex_encode(data: &str) -> String {
    hex::encode(data.as_bytes())
}

/// AES-128-CBC with PKCS#7 padding. Ciphertext is base64, key and IV hex.
pub fn aes_cbc_decrypt(data_b64: &str, key_hex: &str, iv_hex: &str) -> Result<String> {
    let data = base64::engine::general_purpose::STANDARD
        .decode(data_b64.trim())
        .map_err(|e| CapabilityError::Decode(format!("invalid base64 ciphertext: {e}")))?;
    let key = hex::decode(key_hex).map_err(|e| CapabilityError::Decode(format!("invalid key: {e}")))?;
    let iv = hex::decode(iv_hex).map_err(|e| CapabilityError::Decode(format!("invalid iv: {e}")))?;

    let cipher = Aes128CbcDec::new_from_slices(&key, &iv)
        .map_err(|e| CapabilityError::Decrypt(format!("bad key or iv length: {e}")))?;
    let plain = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&data)
        .map_err(|e| CapabilityError::Decrypt(format!("decryption failed: {e}")))?;

    Ok(String::from_utf8_lossy(&plain).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbc::cipher::BlockEncryptMut;

    #[test]
    fn known_digests() {
        assert_eq!(
            digest_hex("md5", "abc").unwrap(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(
            digest_hex("SHA-256", "abc").unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(digest_hex("sha512", "").unwrap().len(), 128);
    }

    #[test]
    fn unsupported_digest() {
        assert!(matches!(
            digest_hex("crc32", "abc"),
            Err(CapabilityError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn base64_accepts_padding_variants() {
        assert_eq!(base64_encode("hello"), "aGVsbG8=");
        assert_eq!(base64_decode("aGVsbG8=").unwrap(), "hello");
        assert_eq!(base64_decode("aGVsbG8").unwrap(), "hello");
        assert!(base64_decode("%%%").is_err());
    }

    #[test]
    fn aes_cbc_decrypts_what_it_is_given() {
        type Aes128CbcEnc = cbc::Encryptor<Aes128>;
        let key = [7u8; 16];
        let iv = [9u8; 16];
        let ciphertext = Aes128CbcEnc::new_from_slices(&key, &iv)
            .unwrap()
            .encrypt_padded_vec_mut::<Pkcs7>(b"https://cdn.example/v.m3u8");
        let b64 = base64::engine::general_purpose::STANDARD.encode(ciphertext);

        let plain = aes_cbc_decrypt(&b64, &hex::encode(key), &hex::encode(iv)).unwrap();
        assert_eq!(plain, "https://cdn.example/v.m3u8");
    }

    #[test]
    fn aes_rejects_short_key() {
        let err = aes_cbc_decrypt("AAAA", "00", &hex::encode([0u8; 16])).unwrap_err();
        assert!(matches!(err, CapabilityError::Decrypt(_)));
    }
}
