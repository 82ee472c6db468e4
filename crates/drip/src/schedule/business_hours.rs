//! Business-hours adjustment in a tenant's local timezone

use chrono::{DateTime, Days, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Local wall-clock window `[start_hour, end_hour)` during which delivery is allowed
///
/// # Example
///
/// ```
/// use drip::schedule::BusinessHours;
///
/// let hours = BusinessHours::default();
/// assert_eq!(hours.start_hour(), 8);
/// assert_eq!(hours.end_hour(), 20);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessHours {
    start_hour: u32,
    end_hour: u32,
}

/// Error returned for an empty or out-of-range window
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid business hours window [{start}, {end})")]
pub struct InvalidWindow {
    pub start: u32,
    pub end: u32,
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            start_hour: 8,
            end_hour: 20,
        }
    }
}

impl BusinessHours {
    /// Create a window, rejecting `start >= end` and `end > 24`
    pub fn new(start_hour: u32, end_hour: u32) -> Result<Self, InvalidWindow> {
        if start_hour >= end_hour || end_hour > 24 {
            return Err(InvalidWindow {
                start: start_hour,
                end: end_hour,
            });
        }
        Ok(Self {
            start_hour,
            end_hour,
        })
    }

    pub fn start_hour(&self) -> u32 {
        self.start_hour
    }

    pub fn end_hour(&self) -> u32 {
        self.end_hour
    }

    /// Whether `instant` falls inside the window in `tz`
    pub fn contains(&self, instant: DateTime<Utc>, tz: Tz) -> bool {
        let hour = instant.with_timezone(&tz).hour();
        hour >= self.start_hour && hour < self.end_hour
    }

    /// Push `instant` forward to the next window opening if it lies outside the window.
    ///
    /// Instants inside the window are returned unchanged. Before the window the result
    /// is the same local day at `start_hour:00:00.000`; at or after the window end it is
    /// the next local day at `start_hour:00:00.000`. The result is never earlier than
    /// the input, so an ordered sequence stays ordered after adjustment.
    pub fn adjust(&self, instant: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
        let local = instant.with_timezone(&tz);
        let hour = local.hour();

        if hour >= self.start_hour && hour < self.end_hour {
            return instant;
        }

        let day = local.date_naive();
        let target_day = if hour < self.start_hour {
            day
        } else {
            day.checked_add_days(Days::new(1)).unwrap_or(day)
        };

        let opening = self.opening_on(target_day, tz);
        // A DST gap can resolve the opening to an instant before the input; never move backwards.
        opening.max(instant)
    }

    /// First instant at or after `start_hour:00` local time on `day`
    fn opening_on(&self, day: NaiveDate, tz: Tz) -> DateTime<Utc> {
        let naive = NaiveDateTime::new(
            day,
            NaiveTime::from_hms_opt(self.start_hour, 0, 0).unwrap_or(NaiveTime::MIN),
        );

        match tz.from_local_datetime(&naive) {
            LocalResult::Single(dt) => dt.with_timezone(&Utc),
            LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
            LocalResult::None => {
                // Opening falls in a DST gap: walk forward a minute at a time until it exists.
                let mut probe = naive;
                for _ in 0..180 {
                    probe += chrono::Duration::minutes(1);
                    if let Some(dt) = tz.from_local_datetime(&probe).earliest() {
                        return dt.with_timezone(&Utc);
                    }
                }
                Utc.from_utc_datetime(&naive)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rand::Rng;

    fn ny() -> Tz {
        "America/New_York".parse().unwrap()
    }

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_inside_window_is_unchanged() {
        let hours = BusinessHours::default();
        // 14:30 EDT
        let t = utc("2024-06-10T18:30:00Z");
        assert_eq!(hours.adjust(t, ny()), t);
    }

    #[test]
    fn test_before_opening_moves_to_same_day_opening() {
        let hours = BusinessHours::default();
        // 05:15 EDT
        let t = utc("2024-06-10T09:15:42.123Z");
        assert_eq!(hours.adjust(t, ny()), utc("2024-06-10T12:00:00Z"));
    }

    #[test]
    fn test_after_close_moves_to_next_day_opening() {
        let hours = BusinessHours::default();
        // 21:00 EDT on June 10 → 08:00 EDT June 11
        let t = utc("2024-06-11T01:00:00Z");
        assert_eq!(hours.adjust(t, ny()), utc("2024-06-11T12:00:00Z"));
    }

    #[test]
    fn test_exactly_at_close_is_outside() {
        let hours = BusinessHours::default();
        // 20:00:00 EST
        let t = utc("2024-01-16T01:00:00Z");
        assert_eq!(hours.adjust(t, ny()), utc("2024-01-16T13:00:00Z"));
    }

    #[test]
    fn test_exactly_at_opening_is_inside() {
        let hours = BusinessHours::default();
        let t = utc("2024-01-15T13:00:00Z");
        assert_eq!(hours.adjust(t, ny()), t);
    }

    #[test]
    fn test_close_before_dst_change_uses_new_offset() {
        let hours = BusinessHours::default();
        // 22:00 EST Saturday 2024-03-09; DST starts 2024-03-10 02:00, opening is 08:00 EDT
        let t = utc("2024-03-10T03:00:00Z");
        assert_eq!(hours.adjust(t, ny()), utc("2024-03-10T12:00:00Z"));
    }

    #[test]
    fn test_custom_window_rejects_invalid() {
        assert!(BusinessHours::new(9, 17).is_ok());
        assert!(BusinessHours::new(17, 9).is_err());
        assert!(BusinessHours::new(8, 8).is_err());
        assert!(BusinessHours::new(8, 25).is_err());
    }

    #[test]
    fn test_adjust_is_idempotent_and_never_earlier() {
        let hours = BusinessHours::default();
        let zones: Vec<Tz> = ["America/New_York", "Europe/Madrid", "Asia/Kolkata", "UTC"]
            .iter()
            .map(|z| z.parse().unwrap())
            .collect();
        let base = utc("2024-01-01T00:00:00Z");
        let mut rng = rand::thread_rng();

        for _ in 0..5_000 {
            let t = base + Duration::seconds(rng.gen_range(0..366 * 24 * 3600));
            let tz = zones[rng.gen_range(0..zones.len())];
            let once = hours.adjust(t, tz);
            assert!(once >= t, "{t} adjusted backwards to {once} in {tz}");
            assert_eq!(hours.adjust(once, tz), once, "not idempotent for {t} in {tz}");
            assert!(hours.contains(once, tz));
        }
    }

    #[test]
    fn test_adjust_preserves_order() {
        let hours = BusinessHours::default();
        let tz = ny();
        let mut t = utc("2024-03-01T00:00:00Z");
        let mut previous = hours.adjust(t, tz);
        for _ in 0..2_000 {
            t += Duration::minutes(17);
            let adjusted = hours.adjust(t, tz);
            assert!(adjusted >= previous);
            previous = adjusted;
        }
    }
}
