//! Version reply codec: `HEAD | model | version | features`.

use crate::constants::{VERSION_HEAD, VERSION_LEN};
use crate::error::ParseError;
use std::fmt;

/// Snapshot of the module identification, read once during setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    pub header: u8,
    pub model: u8,
    pub version: u8,
    pub features: u8,
}

impl VersionInfo {
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        match *bytes {
            [header, model, version, features] => {
                if header != VERSION_HEAD {
                    log::debug!("Version reply carries unusual header 0x{header:02X}");
                }
                Ok(Self {
                    header,
                    model,
                    version,
                    features,
                })
            }
            _ => Err(ParseError::WrongLength {
                expected: VERSION_LEN,
                actual: bytes.len(),
            }),
        }
    }

    pub fn serialize(&self) -> [u8; VERSION_LEN] {
        [self.header, self.model, self.version, self.features]
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "model 0x{:02X} version 0x{:02X} features 0x{:02X}",
            self.model, self.version, self.features
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_version() {
        let info = VersionInfo::parse(&[0xC3, 0x32, 0x27, 0x14]).unwrap();
        assert_eq!(info.model, 0x32);
        assert_eq!(info.version, 0x27);
        assert_eq!(info.features, 0x14);
        assert_eq!(info.to_string(), "model 0x32 version 0x27 features 0x14");
    }

    #[test]
    fn test_parse_version_wrong_length() {
        assert_eq!(
            VersionInfo::parse(&[0xC3, 0x32, 0x27]),
            Err(ParseError::WrongLength {
                expected: 4,
                actual: 3
            })
        );
        assert!(VersionInfo::parse(&[]).is_err());
        assert!(VersionInfo::parse(&[0xC3, 0x32, 0x27, 0x14, 0x00]).is_err());
    }

    proptest! {
        #[test]
        fn prop_version_round_trip(bytes in any::<[u8; 4]>()) {
            let info = VersionInfo::parse(&bytes).unwrap();
            prop_assert_eq!(info.serialize(), bytes);
        }
    }
}
