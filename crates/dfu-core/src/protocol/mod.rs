//! Protocol module - Nordic BLE DFU wire definitions for both dialects.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Declares a closed, byte-coded wire enumeration with canonical
/// code <-> variant <-> display name mappings.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $code:literal => $label:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant, )+
        }

        impl $name {
            /// Every variant, in wire-table order.
            pub const ALL: &'static [$name] = &[ $( $name::$variant, )+ ];

            /// Wire value.
            pub const fn code(self) -> u8 {
                match self {
                    $( $name::$variant => $code, )+
                }
            }

            /// Canonical upper-case name.
            pub const fn name(self) -> &'static str {
                match self {
                    $( $name::$variant => $label, )+
                }
            }

            /// Look up a variant by its wire value.
            pub fn from_code(code: u8) -> Option<Self> {
                match code {
                    $( $code => Some($name::$variant), )+
                    _ => None,
                }
            }

            /// Look up a variant by its canonical name.
            pub fn from_name(name: &str) -> Option<Self> {
                Self::ALL.iter().copied().find(|v| v.name() == name)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.name())
            }
        }

        impl TryFrom<u8> for $name {
            type Error = u8;

            fn try_from(code: u8) -> Result<Self, Self::Error> {
                Self::from_code(code).ok_or(code)
            }
        }

        impl From<$name> for u8 {
            fn from(value: $name) -> u8 {
                value.code()
            }
        }
    };
}

pub mod command;
pub mod constants;
pub mod legacy;
pub mod notification;
pub mod secure;

pub use command::{LegacyCommand, SecureCommand};
pub use constants::*;
pub use legacy::{LegacyOpcode, LegacyResult};
pub use notification::{
    CodecError, LegacyNotification, Notification, SecurePayload, SecureResponse,
};
pub use secure::{ObjectKind, SecureOpcode, SecureResult};

/// Which DFU wire protocol the bootloader speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Nordic SDK < 12: continuous stream, single image-size handshake.
    Legacy,
    /// Nordic SDK >= 12: object based, checksummed and resumable.
    #[default]
    Secure,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Legacy => write!(f, "legacy"),
            Dialect::Secure => write!(f, "secure"),
        }
    }
}

impl std::str::FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "legacy" => Ok(Dialect::Legacy),
            "secure" => Ok(Dialect::Secure),
            other => Err(format!("unknown dialect '{other}' (expected legacy or secure)")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_parse() {
        assert_eq!("legacy".parse::<Dialect>().unwrap(), Dialect::Legacy);
        assert_eq!("SECURE".parse::<Dialect>().unwrap(), Dialect::Secure);
        assert!("nordic".parse::<Dialect>().is_err());
        assert_eq!(Dialect::default(), Dialect::Secure);
    }
}
