//! RFPI identity type.
//!
//! An RFPI (Radio Fixed Part Identity) is the 5-byte identity a DECT
//! basestation broadcasts; handsets are tracked under the RFPI of the call
//! they take part in. The type is a plain value used as a map/list key.

use std::fmt;
use std::str::FromStr;

/// A 5-byte DECT station identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rfpi(pub [u8; 5]);

impl Rfpi {
    pub fn as_bytes(&self) -> &[u8; 5] {
        &self.0
    }
}

impl fmt::Display for Rfpi {
    /// Formats as lowercase hex bytes separated by spaces, e.g.
    /// `00 82 ab 0f 11` — the same shape the operator types back in.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x} {:02x} {:02x} {:02x} {:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4]
        )
    }
}

impl FromStr for Rfpi {
    type Err = ParseRfpiError;

    /// Parses five hex byte pairs. Pairs may be contiguous (`0082ab0f11`)
    /// or separated by a single space or colon (`00:82:ab:0f:11`,
    /// `00 82 ab 0f 11`). Leading whitespace is skipped.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.trim_start().chars();
        let mut bytes = [0u8; 5];

        for (i, byte) in bytes.iter_mut().enumerate() {
            let hi = chars.next().and_then(|c| c.to_digit(16)).ok_or(ParseRfpiError)?;
            let lo = chars.next().and_then(|c| c.to_digit(16)).ok_or(ParseRfpiError)?;
            *byte = ((hi << 4) | lo) as u8;

            // Accept one space or colon between byte pairs. None is ok too.
            if i < 4 {
                let mut peek = chars.clone();
                if matches!(peek.next(), Some(' ') | Some(':')) {
                    chars = peek;
                }
            }
        }

        Ok(Rfpi(bytes))
    }
}

/// The operator-supplied RFPI string was not five hex byte pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseRfpiError;

impl fmt::Display for ParseRfpiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected 5 hex byte pairs (e.g. 00 01 02 03 04)")
    }
}

impl std::error::Error for ParseRfpiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spaced() {
        let rfpi: Rfpi = "00 82 ab 0f 11".parse().unwrap();
        assert_eq!(rfpi.0, [0x00, 0x82, 0xab, 0x0f, 0x11]);
    }

    #[test]
    fn test_parse_colons() {
        let rfpi: Rfpi = "AA:BB:CC:DD:EE".parse().unwrap();
        assert_eq!(rfpi.0, [0xaa, 0xbb, 0xcc, 0xdd, 0xee]);
    }

    #[test]
    fn test_parse_contiguous() {
        let rfpi: Rfpi = "0082ab0f11".parse().unwrap();
        assert_eq!(rfpi.0, [0x00, 0x82, 0xab, 0x0f, 0x11]);
    }

    #[test]
    fn test_parse_leading_whitespace() {
        let rfpi: Rfpi = "  00 01 02 03 04".parse().unwrap();
        assert_eq!(rfpi.0, [0x00, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_parse_rejects_short_and_junk() {
        assert!("00 01 02 03".parse::<Rfpi>().is_err());
        assert!("".parse::<Rfpi>().is_err());
        assert!("zz 01 02 03 04".parse::<Rfpi>().is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        let rfpi = Rfpi([0x00, 0x82, 0xab, 0x0f, 0x11]);
        assert_eq!(rfpi.to_string(), "00 82 ab 0f 11");
        assert_eq!(rfpi.to_string().parse::<Rfpi>().unwrap(), rfpi);
    }
}
