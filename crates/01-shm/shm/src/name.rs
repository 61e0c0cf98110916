//! Short names stored inline in shared tables.

use crate::region::ShmLayout;
use crate::{ShmError, ShmResult};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Longest name, in bytes, a [`ShmName`] can hold.
pub const MAX_NAME_LEN: usize = 31;

/// Length-prefixed UTF-8 name packed into four words. Writers hold the lock
/// of the table the name lives in.
#[repr(C)]
#[derive(Default)]
pub struct ShmName {
    words: [AtomicU64; 4],
}

// SAFETY: repr(C), atomics only; all-zero is the empty name.
unsafe impl ShmLayout for ShmName {}

impl ShmName {
    /// Checks that `name` fits before anything is written.
    pub fn validate(name: &str) -> ShmResult<()> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(ShmError::InvalidCapacity {
                requested: name.len(),
                minimum: 1,
            });
        }
        Ok(())
    }

    pub fn store(&self, name: &str) -> ShmResult<()> {
        Self::validate(name)?;
        let mut bytes = [0u8; 32];
        bytes[0] = name.len() as u8;
        bytes[1..=name.len()].copy_from_slice(name.as_bytes());
        for (word, chunk) in self.words.iter().zip(bytes.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            word.store(u64::from_le_bytes(raw), Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn clear(&self) {
        for word in &self.words {
            word.store(0, Ordering::Relaxed);
        }
    }

    fn bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        for (word, chunk) in self.words.iter().zip(bytes.chunks_exact_mut(8)) {
            chunk.copy_from_slice(&word.load(Ordering::Relaxed).to_le_bytes());
        }
        bytes
    }

    pub fn is_empty(&self) -> bool {
        self.words[0].load(Ordering::Relaxed) & 0xff == 0
    }

    pub fn matches(&self, name: &str) -> bool {
        let bytes = self.bytes();
        let len = bytes[0] as usize;
        len == name.len() && len <= MAX_NAME_LEN && &bytes[1..=len] == name.as_bytes()
    }

    /// Copies the name out; invalid UTF-8 is replaced.
    pub fn load(&self) -> String {
        let bytes = self.bytes();
        let len = (bytes[0] as usize).min(MAX_NAME_LEN);
        String::from_utf8_lossy(&bytes[1..=len]).into_owned()
    }
}

impl fmt::Debug for ShmName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.load())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_matches() {
        let name = ShmName::default();
        assert!(name.is_empty());
        name.store("Surfaces").expect("store");
        assert!(name.matches("Surfaces"));
        assert!(!name.matches("Surface"));
        assert_eq!(name.load(), "Surfaces");
        name.clear();
        assert!(name.is_empty());
    }

    #[test]
    fn rejects_empty_and_long_names() {
        let name = ShmName::default();
        assert!(name.store("").is_err());
        assert!(name.store(&"x".repeat(MAX_NAME_LEN)).is_ok());
        assert!(name.store(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }
}
