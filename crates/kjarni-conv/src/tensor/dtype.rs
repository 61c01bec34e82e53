use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Element kind of a bound buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 8-bit unsigned quantized activations
    U8,
    /// 8-bit signed quantized weights, bias or output
    S8,
    /// 32-bit signed integer bias or output
    S32,
    /// 32-bit float bias or output
    F32,
    /// Absent buffer (only meaningful for a missing bias)
    Undef,
}

impl DType {
    /// Size of one element in bytes. `Undef` has no storage.
    pub fn size_of(&self) -> usize {
        match self {
            DType::U8 | DType::S8 => 1,
            DType::S32 | DType::F32 => 4,
            DType::Undef => 0,
        }
    }

    /// Whether values of this kind are rounded and saturated on store.
    pub fn is_integral(&self) -> bool {
        matches!(self, DType::U8 | DType::S8 | DType::S32)
    }

    pub fn name(&self) -> &'static str {
        match self {
            DType::U8 => "u8",
            DType::S8 => "s8",
            DType::S32 => "s32",
            DType::F32 => "f32",
            DType::Undef => "undef",
        }
    }

    /// Calculates the storage size in bytes for `num_elements` values.
    pub fn buffer_size(&self, num_elements: usize) -> usize {
        num_elements * self.size_of()
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "u8" => Ok(DType::U8),
            "s8" | "i8" => Ok(DType::S8),
            "s32" | "i32" => Ok(DType::S32),
            "f32" => Ok(DType::F32),
            "undef" => Ok(DType::Undef),
            other => Err(anyhow!("Unknown data type '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        assert_eq!("u8".parse::<DType>().unwrap(), DType::U8);
        assert_eq!("S8".parse::<DType>().unwrap(), DType::S8);
        assert_eq!("s32".parse::<DType>().unwrap(), DType::S32);
        assert_eq!("f32".parse::<DType>().unwrap(), DType::F32);
        assert!("f16".parse::<DType>().is_err());
    }

    #[test]
    fn test_sizes() {
        assert_eq!(DType::U8.buffer_size(10), 10);
        assert_eq!(DType::S32.buffer_size(10), 40);
        assert_eq!(DType::Undef.size_of(), 0);
        assert!(DType::S32.is_integral());
        assert!(!DType::F32.is_integral());
    }

    #[test]
    fn test_display_roundtrips_parse() {
        for dt in [DType::U8, DType::S8, DType::S32, DType::F32] {
            assert_eq!(dt.to_string().parse::<DType>().unwrap(), dt);
        }
    }
}
