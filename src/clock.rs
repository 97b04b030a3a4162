//! Device real-time clock blocks and the write-back decision.
//!
//! Both families expose their clock as a block of holding registers but pack
//! it differently: the Growatt spreads a broken-down time over six words,
//! the EPEVER packs two fields per word. The devices keep local time with a
//! fixed offset from UTC; daylight saving is not handled.

use chrono::{Datelike, Duration as TimeDelta, FixedOffset, NaiveDate, NaiveDateTime, Timelike, Utc};
use std::time::Duration;

use crate::error::Error;
use crate::protocol::Word;

/// Drift at which the device clock gets rewritten from the host clock.
pub const CLOCK_OFFSET_THRESHOLD: Duration = Duration::from_secs(30);

/// Forward bias added to the written time to cover the write latency.
pub const WRITE_BIAS_SECONDS: i64 = 2;

/// Fixed timezone of the device clocks, hours east of UTC.
pub const TIMEZONE_OFFSET_HOURS: i32 = 7;

/// Layout of a family's clock block in the holding register bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockLayout {
    /// Six words starting at `address`:
    /// `year - 1900, month, day, hour, minute, second` (Growatt).
    SixWord { address: u16 },
    /// Three packed words starting at `address`:
    /// `minute << 8 | second`, `day << 8 | hour`,
    /// `(year - 2000) << 8 | month` (EPEVER).
    Packed { address: u16 },
}

impl ClockLayout {
    pub const fn address(self) -> u16 {
        match self {
            ClockLayout::SixWord { address } | ClockLayout::Packed { address } => address,
        }
    }

    pub const fn word_count(self) -> u16 {
        match self {
            ClockLayout::SixWord { .. } => 6,
            ClockLayout::Packed { .. } => 3,
        }
    }

    /// Decodes a clock block into the device's local time.
    pub fn decode(self, words: &[Word]) -> Result<NaiveDateTime, Error> {
        let expected = self.word_count() as usize;
        if words.len() != expected {
            return Err(Error::WordCount {
                expected,
                got: words.len(),
            });
        }

        let (year, month, day, hour, minute, second) = match self {
            ClockLayout::SixWord { .. } => (
                1900 + words[0] as i32,
                words[1] as u32,
                words[2] as u32,
                words[3] as u32,
                words[4] as u32,
                words[5] as u32,
            ),
            ClockLayout::Packed { .. } => (
                2000 + (words[2] >> 8) as i32,
                (words[2] & 0xFF) as u32,
                (words[1] >> 8) as u32,
                (words[1] & 0xFF) as u32,
                (words[0] >> 8) as u32,
                (words[0] & 0xFF) as u32,
            ),
        };

        NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|date| date.and_hms_opt(hour, minute, second))
            .ok_or(Error::InvalidClock {
                year,
                month,
                day,
                hour,
                minute,
                second,
            })
    }

    /// Encodes a local time into the family's clock block.
    pub fn encode(self, time: NaiveDateTime) -> Vec<Word> {
        match self {
            ClockLayout::SixWord { .. } => vec![
                (time.year() - 1900) as Word,
                time.month() as Word,
                time.day() as Word,
                time.hour() as Word,
                time.minute() as Word,
                time.second() as Word,
            ],
            ClockLayout::Packed { .. } => vec![
                ((time.minute() << 8) | time.second()) as Word,
                ((time.day() << 8) | time.hour()) as Word,
                ((((time.year() - 2000) as u32) << 8) | time.month()) as Word,
            ],
        }
    }
}

/// The words to write back, if the device clock has drifted past
/// [`CLOCK_OFFSET_THRESHOLD`]. The written time gets a
/// [`WRITE_BIAS_SECONDS`] forward bias so the device lands closer to the
/// host clock once the write round-trip has completed.
pub fn correction(
    layout: ClockLayout,
    device_time: NaiveDateTime,
    host_local: NaiveDateTime,
) -> Option<Vec<Word>> {
    let skew = device_time.signed_duration_since(host_local);
    if skew.num_seconds().unsigned_abs() < CLOCK_OFFSET_THRESHOLD.as_secs() {
        return None;
    }
    Some(layout.encode(host_local + TimeDelta::seconds(WRITE_BIAS_SECONDS)))
}

/// Host wall clock expressed in the device timezone.
pub fn host_local_now() -> NaiveDateTime {
    let timezone = FixedOffset::east_opt(TIMEZONE_OFFSET_HOURS * 3600).expect("valid offset");
    Utc::now().with_timezone(&timezone).naive_local()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIX_WORD: ClockLayout = ClockLayout::SixWord { address: 45 };
    const PACKED: ClockLayout = ClockLayout::Packed { address: 0x9013 };

    fn time(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn six_word_decode() {
        let words = [123, 11, 24, 18, 30, 15];
        assert_eq!(SIX_WORD.decode(&words).unwrap(), time(2023, 11, 24, 18, 30, 15));
    }

    #[test]
    fn packed_decode() {
        let words = [(59 << 8) | 58, (24 << 8) | 23, (25 << 8) | 12];
        assert_eq!(PACKED.decode(&words).unwrap(), time(2025, 12, 24, 23, 59, 58));
    }

    #[test]
    fn encode_decode_round_trips() {
        let moment = time(2026, 8, 1, 6, 7, 8);
        for layout in [SIX_WORD, PACKED] {
            assert_eq!(layout.decode(&layout.encode(moment)).unwrap(), moment);
        }
    }

    #[test]
    fn nonsense_calendar_time_is_rejected() {
        // month 13
        assert!(SIX_WORD.decode(&[123, 13, 1, 0, 0, 0]).is_err());
        assert!(PACKED.decode(&[0, 1 << 8, (25 << 8) | 13]).is_err());
    }

    #[test]
    fn wrong_block_length_is_rejected() {
        assert!(SIX_WORD.decode(&[0; 3]).is_err());
        assert!(PACKED.decode(&[0; 6]).is_err());
    }

    #[test]
    fn drift_below_threshold_is_left_alone() {
        let host = time(2026, 8, 1, 12, 0, 0);
        let device = host + TimeDelta::seconds(29);
        assert_eq!(correction(SIX_WORD, device, host), None);
        assert_eq!(correction(SIX_WORD, host - TimeDelta::seconds(29), host), None);
    }

    #[test]
    fn drift_at_threshold_is_corrected_with_bias() {
        let host = time(2026, 8, 1, 12, 0, 0);

        let words = correction(SIX_WORD, host + TimeDelta::seconds(30), host).unwrap();
        assert_eq!(words, SIX_WORD.encode(time(2026, 8, 1, 12, 0, 2)));

        // a device running 60 seconds ahead gets host time + 2s written back
        let words = correction(PACKED, host + TimeDelta::seconds(60), host).unwrap();
        assert_eq!(words, PACKED.encode(time(2026, 8, 1, 12, 0, 2)));
    }

    #[test]
    fn negative_drift_is_corrected_too() {
        let host = time(2026, 8, 1, 12, 0, 0);
        let words = correction(SIX_WORD, host - TimeDelta::seconds(45), host).unwrap();
        assert_eq!(words, SIX_WORD.encode(time(2026, 8, 1, 12, 0, 2)));
    }
}
