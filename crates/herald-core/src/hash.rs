/// Computes BLAKE3 and returns the 32-byte digest value.
pub fn blake3_32(input: &[u8]) -> [u8; 32] {
    *blake3::hash(input).as_bytes()
}

/// Computes BLAKE3 and returns the lowercase hex digest.
pub fn blake3_hex(input: &[u8]) -> String {
    hex::encode(blake3_32(input))
}
