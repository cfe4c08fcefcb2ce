//! Checksum calculation algorithms
//!
//! Supports: XOR, 4-bit folded XOR (multi-drop camera frames), Sum-8

/// Checksum algorithm types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumType {
    /// XOR of all bytes
    Xor,
    /// XOR folded to the low nibble with the high bit set
    FoldedXor,
    /// Simple sum mod 256
    Sum8,
}

impl ChecksumType {
    /// Get all available checksum types
    pub fn all() -> &'static [ChecksumType] {
        &[ChecksumType::Xor, ChecksumType::FoldedXor, ChecksumType::Sum8]
    }

    /// Get name of checksum type
    pub fn name(&self) -> &'static str {
        match self {
            ChecksumType::Xor => "XOR",
            ChecksumType::FoldedXor => "XOR-4/folded",
            ChecksumType::Sum8 => "Sum-8",
        }
    }
}

impl std::str::FromStr for ChecksumType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "xor" => Ok(Self::Xor),
            "folded" | "folded-xor" | "xor4" => Ok(Self::FoldedXor),
            "sum8" | "sum" => Ok(Self::Sum8),
            other => Err(format!("unknown checksum: {}", other)),
        }
    }
}

/// Calculate checksum for data
pub fn calculate(data: &[u8], algorithm: ChecksumType) -> u8 {
    match algorithm {
        ChecksumType::Xor => xor_checksum(data),
        ChecksumType::FoldedXor => folded_xor(data),
        ChecksumType::Sum8 => sum8_checksum(data),
    }
}

/// Verify checksum
pub fn verify(data: &[u8], checksum: u8, algorithm: ChecksumType) -> bool {
    calculate(data, algorithm) == checksum
}

/// XOR checksum - XOR of all bytes
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// Folded XOR: low nibble of the XOR of all bytes, high bit forced on.
///
/// Always in `0x80..=0x8F`.
pub fn folded_xor(data: &[u8]) -> u8 {
    0x80 | (xor_checksum(data) & 0x0F)
}

/// Simple 8-bit sum
pub fn sum8_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xor() {
        assert_eq!(xor_checksum(&[0x01, 0x02, 0x03]), 0x00);
        assert_eq!(xor_checksum(&[0xFF, 0x00]), 0xFF);
    }

    #[test]
    fn test_folded_xor_range() {
        for a in 0..=255u8 {
            let c = folded_xor(&[a, b'l', 0x35]);
            assert!((0x80..=0x8F).contains(&c));
        }
        // 0x05 ^ 'P' ^ 'S' = 0x05 ^ 0x50 ^ 0x53 = 0x06
        assert_eq!(folded_xor(&[0x05, b'P', b'S']), 0x86);
    }

    #[test]
    fn test_verify_and_parse() {
        assert!(verify(&[1, 2, 3], 6, ChecksumType::Sum8));
        assert!(!verify(&[1, 2, 3], 7, ChecksumType::Sum8));
        assert_eq!("folded".parse::<ChecksumType>(), Ok(ChecksumType::FoldedXor));
        assert!("crc".parse::<ChecksumType>().is_err());
    }
}
