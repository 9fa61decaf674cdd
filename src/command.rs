use std::fmt;

use thiserror::Error;

/// Every command on the serial link is exactly this many bytes.
pub const RECORD_LEN: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("datagram too short: {0} byte(s), need {RECORD_LEN}")]
    TooShort(usize),
    #[error("invalid byte value: {0}")]
    BadByte(String),
}

/// One unit of operator intent: a code byte and a parameter byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandRecord {
    pub code: u8,
    pub param: u8,
}

impl CommandRecord {
    /// Sent by the transmitter when the operator has been silent for a full idle timeout.
    pub const KEEPALIVE: CommandRecord = CommandRecord {
        code: b'k',
        param: 0,
    };

    pub const fn new(code: u8, param: u8) -> Self {
        Self { code, param }
    }

    /// Builds a record from a raw datagram. Bytes past the first two are ignored.
    pub fn from_datagram(payload: &[u8]) -> Result<Self, CommandError> {
        match payload {
            [code, param, ..] => Ok(Self::new(*code, *param)),
            _ => Err(CommandError::TooShort(payload.len())),
        }
    }

    pub const fn to_bytes(self) -> [u8; RECORD_LEN] {
        [self.code, self.param]
    }

    pub fn is_keepalive(self) -> bool {
        self == Self::KEEPALIVE
    }
}

impl fmt::Display for CommandRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:#04x}) | {} ({:#04x})",
            printable(self.code),
            self.code,
            printable(self.param),
            self.param
        )
    }
}

fn printable(b: u8) -> char {
    if b.is_ascii_graphic() { b as char } else { '.' }
}

/// Parses a single byte given on the command line: a lone character (`F`),
/// a decimal value (`100`) or a hex value (`0x41`).
pub fn parse_byte(s: &str) -> Result<u8, CommandError> {
    let bad = || CommandError::BadByte(s.to_string());
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u8::from_str_radix(hex, 16).map_err(|_| bad());
    }
    if let Ok(v) = s.parse::<u8>() {
        return Ok(v);
    }
    let mut chars = s.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii() => Ok(c as u8),
        _ => Err(bad()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn takes_first_two_bytes() {
        let r = CommandRecord::from_datagram(&[0x41, 0x42, 0x43, 0x44]).unwrap();
        assert_eq!(r.to_bytes(), [0x41, 0x42]);
    }

    #[test]
    fn nul_and_high_bytes_are_kept() {
        let r = CommandRecord::from_datagram(&[0x00, 0xFF]).unwrap();
        assert_eq!(r, CommandRecord::new(0, 255));
    }

    #[test]
    fn short_datagrams_rejected() {
        assert_eq!(
            CommandRecord::from_datagram(&[]),
            Err(CommandError::TooShort(0))
        );
        assert_eq!(
            CommandRecord::from_datagram(&[b'F']),
            Err(CommandError::TooShort(1))
        );
    }

    #[test]
    fn keepalive_sentinel() {
        assert_eq!(CommandRecord::KEEPALIVE.to_bytes(), [b'k', 0]);
        assert!(CommandRecord::KEEPALIVE.is_keepalive());
        assert!(!CommandRecord::new(b'k', 1).is_keepalive());
    }

    #[test]
    fn byte_arguments() {
        assert_eq!(parse_byte("F").unwrap(), b'F');
        assert_eq!(parse_byte("7").unwrap(), 7);
        assert_eq!(parse_byte("200").unwrap(), 200);
        assert_eq!(parse_byte("0x41").unwrap(), 0x41);
        assert!(parse_byte("300").is_err());
        assert!(parse_byte("ab").is_err());
        assert!(parse_byte("").is_err());
    }
}
