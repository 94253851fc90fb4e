use std::fmt;

pub const BUILD_ID_SIZE: usize = 20;

/// GNU build id of an ELF file, zero-padded to 20 bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BuildId([u8; BUILD_ID_SIZE]);

impl BuildId {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut id = [0u8; BUILD_ID_SIZE];
        let n = bytes.len().min(BUILD_ID_SIZE);
        id[..n].copy_from_slice(&bytes[..n]);
        BuildId(id)
    }

    /// Parse a hex string such as "0x7f3a..." or "7f3a...".
    pub fn from_hex(s: &str) -> Option<Self> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        if s.len() % 2 != 0 || s.len() > BUILD_ID_SIZE * 2 {
            return None;
        }
        let mut bytes = Vec::with_capacity(s.len() / 2);
        for i in (0..s.len()).step_by(2) {
            bytes.push(u8::from_str_radix(s.get(i..i + 2)?, 16).ok()?);
        }
        Some(Self::from_bytes(&bytes))
    }

    pub fn as_bytes(&self) -> &[u8; BUILD_ID_SIZE] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex() {
        let id = BuildId::from_bytes(&[0xde, 0xad, 0xbe, 0xef]);
        let s = id.to_string();
        assert!(s.starts_with("0xdeadbeef000000"));
        assert_eq!(BuildId::from_hex(&s), Some(id));
        assert_eq!(BuildId::from_hex("deadbeef"), Some(id));
        assert_eq!(BuildId::from_hex("abc"), None);
        assert!(BuildId::default().is_empty());
        assert!(!id.is_empty());
    }
}
