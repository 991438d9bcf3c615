use hmac::{Hmac, KeyInit, Mac};

pub fn hmac_sha256(key: impl AsRef<[u8]>, data: impl AsRef<[u8]>) -> [u8; 32] {
    let mut m = <Hmac<sha2::Sha256> as KeyInit>::new_from_slice(key.as_ref()).expect("HMAC can take key of any size");
    m.update(data.as_ref());
    m.finalize().into_bytes().into()
}

pub fn hmac_sha1(key: impl AsRef<[u8]>, data: impl AsRef<[u8]>) -> [u8; 20] {
    let mut m = <Hmac<sha1::Sha1> as KeyInit>::new_from_slice(key.as_ref()).expect("HMAC can take key of any size");
    m.update(data.as_ref());
    m.finalize().into_bytes().into()
}

pub fn hex(data: impl AsRef<[u8]>) -> String {
    hex_simd::encode_to_string(data.as_ref(), hex_simd::AsciiCase::Lower)
}

/// Constant-time equality of two byte strings.
pub fn ct_eq(lhs: &[u8], rhs: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    lhs.ct_eq(rhs).into()
}
