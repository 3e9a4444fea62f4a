//! Volume TTL — 2 bytes on disk: count, then unit.
//!
//! Units: minute, hour, day, week, month (30 days).  A zero count means
//! "no TTL".  The string form is `<count><unit letter>` (`"5m"`, `"3h"`,
//! `"7d"`, `"2w"`, `"1M"`), the form used in superblocks' human-readable
//! status output and on the CLI.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub struct Ttl {
    count: u8,
    unit: TtlUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlUnit {
    Empty,
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl TtlUnit {
    fn from_byte(b: u8) -> TtlUnit {
        match b {
            1 => TtlUnit::Minute,
            2 => TtlUnit::Hour,
            3 => TtlUnit::Day,
            4 => TtlUnit::Week,
            5 => TtlUnit::Month,
            _ => TtlUnit::Empty,
        }
    }

    fn byte(self) -> u8 {
        match self {
            TtlUnit::Empty => 0,
            TtlUnit::Minute => 1,
            TtlUnit::Hour => 2,
            TtlUnit::Day => 3,
            TtlUnit::Week => 4,
            TtlUnit::Month => 5,
        }
    }

    fn minutes(self) -> u32 {
        match self {
            TtlUnit::Empty => 0,
            TtlUnit::Minute => 1,
            TtlUnit::Hour => 60,
            TtlUnit::Day => 24 * 60,
            TtlUnit::Week => 7 * 24 * 60,
            TtlUnit::Month => 30 * 24 * 60,
        }
    }

    fn letter(self) -> Option<char> {
        match self {
            TtlUnit::Empty => None,
            TtlUnit::Minute => Some('m'),
            TtlUnit::Hour => Some('h'),
            TtlUnit::Day => Some('d'),
            TtlUnit::Week => Some('w'),
            TtlUnit::Month => Some('M'),
        }
    }
}

impl Default for Ttl {
    fn default() -> Ttl {
        Ttl::NONE
    }
}

impl Ttl {
    pub const NONE: Ttl = Ttl { count: 0, unit: TtlUnit::Empty };

    pub fn new(count: u8, unit: TtlUnit) -> Ttl {
        if count == 0 {
            Ttl::NONE
        } else {
            Ttl { count, unit }
        }
    }

    /// Parse `"5m"`, `"3h"`, `"7d"`, `"2w"`, `"1M"`.  Empty string or `"0"`
    /// means no TTL.  Returns `None` on anything else.
    pub fn parse(s: &str) -> Option<Ttl> {
        if s.is_empty() || s == "0" {
            return Some(Ttl::NONE);
        }
        let (digits, letter) = s.split_at(s.len() - 1);
        let count: u8 = digits.parse().ok()?;
        let unit = match letter {
            "m" => TtlUnit::Minute,
            "h" => TtlUnit::Hour,
            "d" => TtlUnit::Day,
            "w" => TtlUnit::Week,
            "M" => TtlUnit::Month,
            _ => return None,
        };
        Some(Ttl::new(count, unit))
    }

    pub fn from_bytes(buf: &[u8; 2]) -> Ttl {
        Ttl::new(buf[0], TtlUnit::from_byte(buf[1]))
    }

    pub fn write_to(self, buf: &mut [u8]) {
        buf[0] = self.count;
        buf[1] = self.unit.byte();
    }

    pub fn is_empty(self) -> bool {
        self.count == 0
    }

    pub fn minutes(self) -> u32 {
        self.count as u32 * self.unit.minutes()
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unit.letter() {
            Some(l) if self.count > 0 => write!(f, "{}{}", self.count, l),
            _ => Ok(()),
        }
    }
}

impl From<Ttl> for String {
    fn from(t: Ttl) -> String {
        t.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        for s in ["5m", "3h", "7d", "2w", "1M"] {
            let ttl = Ttl::parse(s).unwrap();
            assert_eq!(ttl.to_string(), s);
        }
        assert_eq!(Ttl::parse("").unwrap(), Ttl::NONE);
        assert_eq!(Ttl::parse("0").unwrap(), Ttl::NONE);
        assert!(Ttl::parse("5y").is_none());
    }

    #[test]
    fn byte_round_trip() {
        let ttl = Ttl::parse("5m").unwrap();
        let mut buf = [0u8; 2];
        ttl.write_to(&mut buf);
        assert_eq!(buf, [5, 1]);
        assert_eq!(Ttl::from_bytes(&buf), ttl);
        assert_eq!(ttl.minutes(), 5);
    }

    #[test]
    fn zero_count_normalises_to_none() {
        let mut buf = [0u8; 2];
        Ttl::new(0, TtlUnit::Hour).write_to(&mut buf);
        assert_eq!(buf, [0, 0]);
    }
}
