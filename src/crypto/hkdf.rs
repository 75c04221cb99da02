use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HkdfError {
    #[error("Invalid output length for HKDF expand")]
    InvalidLength,
}

/// Expands a key using HKDF-SHA256.
///
/// # Arguments
///
/// * `key`: The input keying material.
/// * `salt`: An optional salt.
/// * `info`: Context information binding the output to its use.
/// * `length`: The desired length of the output key.
pub fn sha256(
    key: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    length: usize,
) -> Result<Vec<u8>, HkdfError> {
    let hk = Hkdf::<Sha256>::new(salt, key);
    let mut okm = vec![0u8; length];
    hk.expand(info, &mut okm)
        .map_err(|_| HkdfError::InvalidLength)?;
    Ok(okm)
}

/// Same as [`sha256`] but for fixed-size outputs such as AES keys.
pub fn sha256_array<const N: usize>(
    key: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
) -> Result<[u8; N], HkdfError> {
    let hk = Hkdf::<Sha256>::new(salt, key);
    let mut okm = [0u8; N];
    hk.expand(info, &mut okm)
        .map_err(|_| HkdfError::InvalidLength)?;
    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_separates_outputs() {
        let a = sha256_array::<32>(b"ikm", None, b"one").unwrap();
        let b = sha256_array::<32>(b"ikm", None, b"two").unwrap();
        assert_ne!(a, b);
        assert_eq!(sha256(b"ikm", None, b"one", 32).unwrap(), a.to_vec());
    }

    #[test]
    fn test_too_long_output() {
        assert!(sha256(b"ikm", None, b"", 255 * 32 + 1).is_err());
    }
}
