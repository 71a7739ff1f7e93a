use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::America::New_York;
use std::collections::HashSet;

use super::MarketCalendar;

/// Regular NYSE session: weekdays 09:30–16:00 America/New_York. Closed on
/// the exchange's full-day holidays plus any configured extra dates, and
/// closing at 13:00 on its early-close days.
#[derive(Debug, Clone)]
pub struct NyseCalendar {
    extra_holidays: HashSet<NaiveDate>,
    open: NaiveTime,
    close: NaiveTime,
    early_close: NaiveTime,
}

impl NyseCalendar {
    pub fn new(extra_holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            extra_holidays: extra_holidays.into_iter().collect(),
            open: NaiveTime::from_hms_opt(9, 30, 0).unwrap_or_default(),
            close: NaiveTime::from_hms_opt(16, 0, 0).unwrap_or_default(),
            early_close: NaiveTime::from_hms_opt(13, 0, 0).unwrap_or_default(),
        }
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.extra_holidays.contains(&date) || nyse_holidays(date.year()).contains(&date)
    }

    /// Closing time for a trading day.
    fn close_on(&self, date: NaiveDate) -> NaiveTime {
        if nyse_early_closes(date.year()).contains(&date) {
            self.early_close
        } else {
            self.close
        }
    }
}

impl Default for NyseCalendar {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl MarketCalendar for NyseCalendar {
    fn is_open(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&New_York);
        let date = local.date_naive();

        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) || self.is_holiday(date) {
            return false;
        }

        let time = local.time();
        self.open <= time && time <= self.close_on(date)
    }
}

/// Full-day NYSE closures in `year`, as observed. A holiday on Saturday
/// moves to Friday and one on Sunday to Monday, except New Year's Day,
/// which is not made up when it lands on a Saturday.
pub fn nyse_holidays(year: i32) -> Vec<NaiveDate> {
    let fixed = |month, day| NaiveDate::from_ymd_opt(year, month, day);
    let nth = |month, weekday, n| NaiveDate::from_weekday_of_month_opt(year, month, weekday, n);

    let new_year = fixed(1, 1).filter(|d| d.weekday() != Weekday::Sat).map(observed);
    let juneteenth = if year >= 2022 { fixed(6, 19).map(observed) } else { None };

    [
        new_year,
        nth(1, Weekday::Mon, 3),
        nth(2, Weekday::Mon, 3),
        easter_sunday(year).and_then(|d| d.checked_sub_days(Days::new(2))),
        nth(5, Weekday::Mon, 5).or_else(|| nth(5, Weekday::Mon, 4)),
        juneteenth,
        fixed(7, 4).map(observed),
        nth(9, Weekday::Mon, 1),
        nth(11, Weekday::Thu, 4),
        fixed(12, 25).map(observed),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// Days the NYSE closes at 13:00: July 3 and Christmas Eve when they fall
/// Monday to Thursday, and the day after Thanksgiving.
pub fn nyse_early_closes(year: i32) -> Vec<NaiveDate> {
    let mon_to_thu = |date: &NaiveDate| !matches!(date.weekday(), Weekday::Fri | Weekday::Sat | Weekday::Sun);

    [
        NaiveDate::from_ymd_opt(year, 7, 3).filter(mon_to_thu),
        NaiveDate::from_weekday_of_month_opt(year, 11, Weekday::Thu, 4).and_then(|d| d.succ_opt()),
        NaiveDate::from_ymd_opt(year, 12, 24).filter(mon_to_thu),
    ]
    .into_iter()
    .flatten()
    .collect()
}

fn observed(date: NaiveDate) -> NaiveDate {
    let shifted = match date.weekday() {
        Weekday::Sat => date.pred_opt(),
        Weekday::Sun => date.succ_opt(),
        _ => Some(date),
    };
    shifted.unwrap_or(date)
}

/// Anonymous Gregorian computus.
fn easter_sunday(year: i32) -> Option<NaiveDate> {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    NaiveDate::from_ymd_opt(year, u32::try_from(month).ok()?, u32::try_from(day).ok()?)
}

/// Calendar with a fixed answer. Paper trading outside market hours and tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedCalendar(pub bool);

impl MarketCalendar for FixedCalendar {
    fn is_open(&self, _at: DateTime<Utc>) -> bool {
        self.0
    }
}
