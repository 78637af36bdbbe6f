//! Single-byte XOR scrambling of encoded frames.
//!
//! Keeps casual observers from reading paths off the wire. It is not a
//! cipher: anyone holding one frame can recover the key byte.

/// XOR key derived from a shared secret. Disabled when no secret is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Scrambler {
    key: Option<u8>,
}

impl Scrambler {
    pub fn disabled() -> Self {
        Self { key: None }
    }

    pub fn with_key(key: u8) -> Self {
        Self { key: Some(key) }
    }

    /// Derive the key by XOR-folding the UTF-8 bytes of `secret`.
    /// `None` or an empty secret disables scrambling.
    pub fn from_secret(secret: Option<&str>) -> Self {
        match secret {
            Some(s) if !s.is_empty() => Self::with_key(fold_key(s)),
            _ => Self::disabled(),
        }
    }

    pub fn key(&self) -> Option<u8> {
        self.key
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    /// Scramble or unscramble in place; the operation is its own inverse.
    pub fn apply(&self, buf: &mut [u8]) {
        if let Some(key) = self.key {
            for b in buf.iter_mut() {
                *b ^= key;
            }
        }
    }
}

pub fn fold_key(secret: &str) -> u8 {
    secret.as_bytes().iter().fold(0u8, |acc, b| acc ^ b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fold_key() {
        assert_eq!(fold_key("a"), b'a');
        assert_eq!(fold_key("ab"), b'a' ^ b'b');
        // pairs cancel out
        assert_eq!(fold_key("aa"), 0);
    }

    #[test]
    fn test_empty_secret_disables() {
        assert!(!Scrambler::from_secret(None).is_enabled());
        assert!(!Scrambler::from_secret(Some("")).is_enabled());
        assert!(Scrambler::from_secret(Some("pw")).is_enabled());
    }

    #[test]
    fn test_disabled_is_identity() {
        let mut data = b"plain".to_vec();
        Scrambler::disabled().apply(&mut data);
        assert_eq!(data, b"plain");
    }

    #[test]
    fn test_scramble_changes_bytes() {
        let scrambler = Scrambler::with_key(0x5a);
        let mut data = vec![0x00, 0x5a, 0xff];
        scrambler.apply(&mut data);
        assert_eq!(data, vec![0x5a, 0x00, 0xa5]);
    }

    proptest! {
        #[test]
        fn prop_scramble_is_involutive(key in any::<u8>(), data in proptest::collection::vec(any::<u8>(), 0..512)) {
            let scrambler = Scrambler::with_key(key);
            let mut buf = data.clone();
            // include the key byte itself in the content
            buf.push(key);
            let original = buf.clone();
            scrambler.apply(&mut buf);
            scrambler.apply(&mut buf);
            prop_assert_eq!(buf, original);
        }
    }
}
