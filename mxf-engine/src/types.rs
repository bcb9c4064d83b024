//! Shared value types: rationals, identifiers and timestamps

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{Read, Write};

use crate::error::Result;

/// Rational number for edit rates and sampling rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Rational {
    pub numerator: i32,
    pub denominator: i32,
}

impl Rational {
    /// Create new rational
    pub const fn new(numerator: i32, denominator: i32) -> Self {
        Rational { numerator, denominator }
    }

    /// Equality of the rates, ignoring representation (50/2 == 25/1)
    pub fn same_rate(&self, other: &Rational) -> bool {
        self.numerator as i64 * other.denominator as i64
            == other.numerator as i64 * self.denominator as i64
    }

    /// Check that both terms are positive
    pub fn is_valid_rate(&self) -> bool {
        self.numerator > 0 && self.denominator > 0
    }

    pub const fn fps_25() -> Self {
        Rational::new(25, 1)
    }

    pub const fn fps_29_97() -> Self {
        Rational::new(30000, 1001)
    }

    pub const fn fps_59_94() -> Self {
        Rational::new(60000, 1001)
    }

    pub const fn hz_48000() -> Self {
        Rational::new(48000, 1)
    }

    pub(crate) fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let numerator = reader.read_i32::<BigEndian>()?;
        let denominator = reader.read_i32::<BigEndian>()?;
        Ok(Rational { numerator, denominator })
    }

    pub(crate) fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_i32::<BigEndian>(self.numerator)?;
        writer.write_i32::<BigEndian>(self.denominator)?;
        Ok(())
    }
}

impl Default for Rational {
    fn default() -> Self {
        Rational::fps_25()
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

/// Edit rate of an essence container
pub type EditRate = Rational;

pub(crate) fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// 16-byte instance identifier for index segments and metadata sets
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InstanceUid(pub [u8; 16]);

impl InstanceUid {
    /// Generate a random identifier
    pub fn generate() -> Self {
        InstanceUid(*uuid::Uuid::new_v4().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_nil(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl fmt::Debug for InstanceUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", uuid::Uuid::from_bytes(self.0))
    }
}

/// UMID (Unique Material Identifier) - 32 bytes
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Umid(pub [u8; 32]);

impl Umid {
    /// Generate a new UMID with a random material number
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];

        // SMPTE 330M label, length 0x13, no instance, UUID material number
        bytes[0..12].copy_from_slice(&[
            0x06, 0x0A, 0x2B, 0x34, 0x01, 0x01, 0x01, 0x05, 0x01, 0x01, 0x0F, 0x20,
        ]);
        bytes[12] = 0x13;
        bytes[16..32].copy_from_slice(uuid::Uuid::new_v4().as_bytes());

        Umid(bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl Default for Umid {
    fn default() -> Self {
        Umid([0; 32])
    }
}

impl fmt::Debug for Umid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UMID(")?;
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 && i % 4 == 0 {
                write!(f, "-")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

/// MXF timestamp (8 bytes, quarter-milliseconds in the last byte)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamp {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub qmsec: u8,
}

impl Timestamp {
    /// Timestamp for the given seconds since the Unix epoch (UTC)
    pub fn from_unix_seconds(secs: u64) -> Self {
        let days = (secs / 86400) as i64;
        let rem = secs % 86400;

        // civil-from-days
        let z = days + 719_468;
        let era = z.div_euclid(146_097);
        let doe = z - era * 146_097;
        let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
        let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
        let mp = (5 * doy + 2) / 153;
        let day = (doy - (153 * mp + 2) / 5 + 1) as u8;
        let month = if mp < 10 { mp + 3 } else { mp - 9 } as u8;
        let year = (yoe + era * 400 + i64::from(month <= 2)) as u16;

        Timestamp {
            year,
            month,
            day,
            hour: (rem / 3600) as u8,
            minute: (rem % 3600 / 60) as u8,
            second: (rem % 60) as u8,
            qmsec: 0,
        }
    }

    /// Current system time
    pub fn now() -> Self {
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Timestamp::from_unix_seconds(secs)
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let year = self.year.to_be_bytes();
        [
            year[0],
            year[1],
            self.month,
            self.day,
            self.hour,
            self.minute,
            self.second,
            self.qmsec,
        ]
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}
