//! Lifecycle status derivation.
//!
//! Comparisons are made on calendar days only. Clauses are evaluated in order
//! and the first one that decides wins:
//!
//! 1. bidding has not begun yet: `pending`
//! 2. the opening day has arrived: `opened`, or `completed` once a rebid
//!    opening has also passed
//! 3. the day after bid close: `closed` (the closing day itself is `active`)
//! 4. otherwise `active`

use chrono::NaiveDate;

use crate::{TenderStatus, TenderTimeline};

pub fn derive_status(timeline: &TenderTimeline, today: NaiveDate) -> TenderStatus {
    if let Some(begin) = timeline.bid_begin_at {
        if today < begin.date() {
            return TenderStatus::Pending;
        }
    }

    if let Some(opening) = timeline.opening_at {
        let opening_day = opening.date();
        if today > opening_day {
            return match timeline.rebid_opening_at {
                Some(rebid) if today > rebid.date() => TenderStatus::Completed,
                _ => TenderStatus::Opened,
            };
        }
        if today == opening_day {
            return TenderStatus::Opened;
        }
    }

    if let Some(close) = timeline.bid_close_at {
        if today > close.date() {
            return TenderStatus::Closed;
        }
    }

    TenderStatus::Active
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        day(y, m, d).and_hms_opt(h, 0, 0).unwrap()
    }

    fn timeline(
        begin: Option<NaiveDateTime>,
        close: Option<NaiveDateTime>,
        opening: Option<NaiveDateTime>,
        rebid: Option<NaiveDateTime>,
    ) -> TenderTimeline {
        TenderTimeline {
            bid_begin_at: begin,
            bid_close_at: close,
            opening_at: opening,
            rebid_opening_at: rebid,
            ..TenderTimeline::default()
        }
    }

    #[test]
    fn before_bid_begin_is_pending() {
        let t = timeline(Some(at(2025, 9, 5, 9)), Some(at(2025, 9, 10, 18)), None, None);
        assert_eq!(derive_status(&t, day(2025, 9, 4)), TenderStatus::Pending);
        assert_eq!(derive_status(&t, day(2025, 9, 5)), TenderStatus::Active);
    }

    #[test]
    fn close_day_is_still_active_and_the_next_day_is_closed() {
        let t = timeline(None, Some(at(2025, 9, 10, 23)), None, None);
        assert_eq!(derive_status(&t, day(2025, 9, 10)), TenderStatus::Active);
        assert_eq!(derive_status(&t, day(2025, 9, 11)), TenderStatus::Closed);
    }

    #[test]
    fn opening_day_is_opened() {
        let t = timeline(None, Some(at(2025, 9, 10, 10)), Some(at(2025, 9, 11, 11)), None);
        assert_eq!(derive_status(&t, day(2025, 9, 11)), TenderStatus::Opened);
        assert_eq!(derive_status(&t, day(2025, 9, 20)), TenderStatus::Opened);
    }

    #[test]
    fn before_opening_falls_through_to_close_check() {
        let t = timeline(None, Some(at(2025, 9, 10, 10)), Some(at(2025, 9, 12, 11)), None);
        assert_eq!(derive_status(&t, day(2025, 9, 11)), TenderStatus::Closed);
        assert_eq!(derive_status(&t, day(2025, 9, 9)), TenderStatus::Active);
    }

    #[test]
    fn rebid_opening_passed_is_completed() {
        let t = timeline(
            None,
            Some(at(2025, 9, 10, 10)),
            Some(at(2025, 9, 11, 11)),
            Some(at(2025, 9, 15, 11)),
        );
        assert_eq!(derive_status(&t, day(2025, 9, 15)), TenderStatus::Opened);
        assert_eq!(derive_status(&t, day(2025, 9, 16)), TenderStatus::Completed);
    }

    #[test]
    fn sub_day_times_never_matter() {
        let late = timeline(None, Some(at(2025, 9, 10, 0)), None, None);
        let early = timeline(None, Some(at(2025, 9, 10, 23)), None, None);
        assert_eq!(
            derive_status(&late, day(2025, 9, 10)),
            derive_status(&early, day(2025, 9, 10))
        );
    }

    #[test]
    fn no_timestamps_defaults_to_active() {
        assert_eq!(
            derive_status(&TenderTimeline::default(), day(2025, 9, 1)),
            TenderStatus::Active
        );
    }

    #[test]
    fn status_never_moves_backwards_as_days_pass() {
        fn rank(status: TenderStatus) -> u8 {
            match status {
                TenderStatus::Pending => 0,
                TenderStatus::Active => 1,
                TenderStatus::Closed => 2,
                TenderStatus::Opened => 3,
                TenderStatus::Completed => 4,
                TenderStatus::Cancelled => 5,
            }
        }

        let t = timeline(
            Some(at(2025, 9, 1, 9)),
            Some(at(2025, 9, 10, 18)),
            Some(at(2025, 9, 12, 11)),
            Some(at(2025, 9, 20, 11)),
        );
        let mut previous = TenderStatus::Pending;
        for offset in 0..40 {
            let today = day(2025, 8, 25) + chrono::Duration::days(offset);
            let current = derive_status(&t, today);
            assert!(rank(current) >= rank(previous), "{previous} -> {current} on {today}");
            previous = current;
        }
        assert_eq!(previous, TenderStatus::Completed);
    }
}
