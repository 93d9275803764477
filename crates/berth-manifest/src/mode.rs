//! Permission modes as written in manifests.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Unix permission bits.
///
/// Accepts either an integer or an octal string (`"0755"`, `"0o755"`, `"755"`).
/// Octal strings are the readable form; plain integers are taken as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileMode(pub u32);

impl FileMode {
    /// Parse an octal string.
    ///
    /// # Errors
    ///
    /// Returns a message if the string is not octal or exceeds `0o7777`.
    pub fn parse_octal(s: &str) -> Result<Self, String> {
        let digits = s.trim().trim_start_matches("0o");
        let bits = u32::from_str_radix(digits, 8).map_err(|e| format!("invalid mode {s:?}: {e}"))?;
        Self::checked(bits)
    }

    fn checked(bits: u32) -> Result<Self, String> {
        if bits > 0o7777 {
            return Err(format!("mode {bits:#o} out of range"));
        }
        Ok(Self(bits))
    }

    /// Raw permission bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04o}", self.0)
    }
}

impl Serialize for FileMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FileMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u32),
            Str(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(bits) => Self::checked(bits),
            Raw::Str(s) => Self::parse_octal(&s),
        }
        .map_err(serde::de::Error::custom)
    }
}
