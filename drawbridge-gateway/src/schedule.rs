//! Recurring time-window evaluation for policies.
//!
//! Each rule is evaluated in its own IANA timezone. A `None` dimension means
//! "any"; a rule matches when every present dimension matches. Time ranges
//! with `time_start > time_end` cross local midnight.

use chrono::{DateTime, Datelike as _, Days, NaiveDateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use grant_store::ScheduleRule;

const END_OF_DAY: NaiveTime = match NaiveTime::from_hms_opt(23, 59, 59) {
    Some(t) => t,
    None => unreachable!(),
};

fn rule_timezone(rule: &ScheduleRule) -> Option<Tz> {
    match rule.timezone.parse::<Tz>() {
        Ok(tz) => Some(tz),
        Err(_) => {
            warn!(timezone = %rule.timezone, rule.id, "Unknown timezone on schedule rule");
            None
        }
    }
}

/// Maps a local wall-clock datetime into the zone, biased toward the earlier
/// instant on DST ambiguity and skipping forward over DST gaps.
fn resolve_local(naive: NaiveDateTime, tz: Tz) -> Option<DateTime<Tz>> {
    use chrono::offset::LocalResult;
    use chrono::TimeZone as _;

    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => tz
            .from_local_datetime(&naive.checked_add_signed(chrono::Duration::hours(1))?)
            .earliest(),
    }
}

/// True when `now` falls inside the rule's window, wall-clock in the rule's
/// timezone.
pub fn matches(rule: &ScheduleRule, now: DateTime<Utc>) -> bool {
    let Some(tz) = rule_timezone(rule) else {
        return false;
    };
    let local = now.with_timezone(&tz);

    if let Some(weekdays) = rule.weekdays.as_deref()
        && !weekdays.is_empty()
    {
        let weekday = rule_weekday(&local);
        if !weekdays.contains(&weekday) {
            return false;
        }
    }

    if rule.time_start.is_some() || rule.time_end.is_some() {
        let start = rule.time_start.unwrap_or(NaiveTime::MIN);
        let end = rule.time_end.unwrap_or(END_OF_DAY);
        let current = local.time();

        let inside = if start <= end {
            start <= current && current <= end
        } else {
            // Crosses midnight, e.g. 22:00-02:00.
            current >= start || current <= end
        };
        if !inside {
            return false;
        }
    }

    if let Some(months) = rule.months.as_deref()
        && !months.is_empty()
        && !months.contains(&month_of(&local))
    {
        return false;
    }

    if let Some(days) = rule.days_of_month.as_deref()
        && !days.is_empty()
        && !days.contains(&day_of(&local))
    {
        return false;
    }

    true
}

fn rule_weekday(local: &DateTime<Tz>) -> u8 {
    // 0=Monday … 6=Sunday.
    local.weekday().num_days_from_monday() as u8
}

fn month_of(local: &DateTime<Tz>) -> u8 {
    local.month() as u8
}

fn day_of(local: &DateTime<Tz>) -> u8 {
    local.day() as u8
}

/// The UTC instant at which the window containing `now` closes, or `None`
/// when the rule does not match at `now`.
///
/// A missing `time_end` closes at 23:59:59 local. When the range crosses
/// midnight and `now` sits in the pre-midnight half, the window closes on
/// tomorrow's local date.
pub fn window_end(rule: &ScheduleRule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if !matches(rule, now) {
        return None;
    }

    let tz = rule_timezone(rule)?;
    let local = now.with_timezone(&tz);

    let end = rule.time_end.unwrap_or(END_OF_DAY);
    let crosses_midnight = matches!(rule.time_start, Some(start) if start > end);

    let end_date = if crosses_midnight && local.time() >= rule.time_start? {
        local.date_naive().checked_add_days(Days::new(1))?
    } else {
        local.date_naive()
    };

    let end_local = resolve_local(end_date.and_time(end), tz)?;
    Some(end_local.with_timezone(&Utc))
}

/// The earliest window end over all matching active rules.
pub fn earliest_window_end(rules: &[ScheduleRule], now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    rules
        .iter()
        .filter(|rule| rule.is_active)
        .filter_map(|rule| window_end(rule, now))
        .min()
}

/// Whether any active rule matches; reports the first matching rule's name.
///
/// An empty rule set means schedule-based gating is disabled: `(true, None)`.
pub fn any_matches<'a>(rules: &'a [ScheduleRule], now: DateTime<Utc>) -> (bool, Option<&'a str>) {
    if rules.is_empty() {
        return (true, None);
    }

    for rule in rules.iter().filter(|rule| rule.is_active) {
        if matches(rule, now) {
            return (true, rule.name.as_deref().or(Some("unnamed schedule")));
        }
    }

    (false, None)
}

/// Short human description of a rule, for logs and messages.
pub fn describe(rule: &ScheduleRule) -> String {
    const WEEKDAY_NAMES: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
    const MONTH_NAMES: [&str; 13] = [
        "", "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];

    let mut parts = Vec::new();

    if let Some(weekdays) = rule.weekdays.as_deref()
        && !weekdays.is_empty()
    {
        let mut sorted = weekdays.to_vec();
        sorted.sort_unstable();
        parts.push(match sorted.as_slice() {
            [0, 1, 2, 3, 4] => "Mon-Fri".to_owned(),
            [5, 6] => "Weekends".to_owned(),
            [0, 1, 2, 3, 4, 5, 6] => "Every day".to_owned(),
            days => days
                .iter()
                .filter_map(|&d| WEEKDAY_NAMES.get(usize::from(d)))
                .copied()
                .collect::<Vec<_>>()
                .join("/"),
        });
    }

    if let Some(months) = rule.months.as_deref()
        && !months.is_empty()
    {
        let mut sorted = months.to_vec();
        sorted.sort_unstable();
        let names: Vec<_> = sorted
            .iter()
            .filter_map(|&m| MONTH_NAMES.get(usize::from(m)))
            .copied()
            .collect();
        parts.push(if names.len() == 1 {
            format!("{} only", names[0])
        } else {
            names.join("/")
        });
    }

    if let Some(days) = rule.days_of_month.as_deref()
        && !days.is_empty()
    {
        let mut sorted = days.to_vec();
        sorted.sort_unstable();
        parts.push(format!(
            "Days: {}",
            sorted.iter().map(u8::to_string).collect::<Vec<_>>().join(",")
        ));
    }

    if rule.time_start.is_some() || rule.time_end.is_some() {
        let start = rule.time_start.unwrap_or(NaiveTime::MIN);
        let end = rule.time_end.unwrap_or(END_OF_DAY);
        parts.push(format!("{}-{}", start.format("%H:%M"), end.format("%H:%M")));
    }

    if parts.is_empty() {
        "Always".to_owned()
    } else {
        parts.join(" ")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone as _;
    use rstest::rstest;

    use super::*;

    fn rule() -> ScheduleRule {
        ScheduleRule {
            id: 1,
            policy_id: 1,
            name: Some("Business hours".to_owned()),
            weekdays: Some(vec![0, 1, 2, 3, 4]),
            time_start: NaiveTime::from_hms_opt(8, 0, 0),
            time_end: NaiveTime::from_hms_opt(16, 0, 0),
            months: None,
            days_of_month: None,
            timezone: "Europe/Warsaw".to_owned(),
            is_active: true,
        }
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[rstest]
    // 2026-01-05 is a Monday; Warsaw is UTC+1 in winter.
    #[case(utc(2026, 1, 5, 9, 0, 0), true)] // Mon 10:00 Warsaw
    #[case(utc(2026, 1, 5, 17, 0, 0), false)] // Mon 18:00 Warsaw
    #[case(utc(2026, 1, 10, 9, 0, 0), false)] // Sat 10:00 Warsaw
    #[case(utc(2026, 1, 5, 7, 0, 0), true)] // Mon 08:00 Warsaw, boundary
    #[case(utc(2026, 1, 5, 6, 59, 59), false)] // Mon 07:59:59 Warsaw
    #[case(utc(2026, 1, 5, 15, 0, 0), true)] // Mon 16:00 Warsaw, closed end
    #[case(utc(2026, 1, 5, 15, 0, 1), false)] // Mon 16:00:01 Warsaw
    fn business_hours_match(#[case] now: DateTime<Utc>, #[case] expected: bool) {
        assert_eq!(matches(&rule(), now), expected);
    }

    #[test]
    fn matching_is_weekly_periodic() {
        let now = utc(2026, 1, 6, 9, 0, 0);
        let next_week = now + chrono::Duration::days(7);
        assert_eq!(matches(&rule(), now), matches(&rule(), next_week));
    }

    #[test]
    fn timezone_shifts_the_window() {
        let mut tokyo = rule();
        tokyo.timezone = "Asia/Tokyo".to_owned();
        // Mon 09:00 UTC is Mon 18:00 in Tokyo: outside 08:00-16:00.
        assert!(!matches(&tokyo, utc(2026, 1, 5, 9, 0, 0)));
        // Mon 01:00 UTC is Mon 10:00 in Tokyo.
        assert!(matches(&tokyo, utc(2026, 1, 5, 1, 0, 0)));
    }

    #[test]
    fn cross_midnight_range_boundaries() {
        let mut night = rule();
        night.weekdays = None;
        night.time_start = NaiveTime::from_hms_opt(22, 0, 0);
        night.time_end = NaiveTime::from_hms_opt(2, 0, 0);

        // Warsaw local times: 21:59:59 no, 22:00 yes, 02:00 yes, 02:00:01 no.
        assert!(!matches(&night, utc(2026, 1, 5, 20, 59, 59)));
        assert!(matches(&night, utc(2026, 1, 5, 21, 0, 0)));
        assert!(matches(&night, utc(2026, 1, 6, 1, 0, 0)));
        assert!(!matches(&night, utc(2026, 1, 6, 1, 0, 1)));
    }

    #[test]
    fn window_end_is_end_of_business_day() {
        // Tuesday 2026-02-10, 10:00 Warsaw (09:00 UTC); window closes at
        // 16:00 Warsaw which is 15:00 UTC.
        let end = window_end(&rule(), utc(2026, 2, 10, 9, 0, 0)).unwrap();
        assert_eq!(end, utc(2026, 2, 10, 15, 0, 0));
    }

    #[test]
    fn window_end_outside_window_is_none() {
        assert!(window_end(&rule(), utc(2026, 2, 10, 20, 0, 0)).is_none());
    }

    #[test]
    fn window_end_defaults_to_end_of_day() {
        let mut open_ended = rule();
        open_ended.time_start = None;
        open_ended.time_end = None;

        let end = window_end(&open_ended, utc(2026, 2, 10, 9, 0, 0)).unwrap();
        // 23:59:59 Warsaw == 22:59:59 UTC in winter.
        assert_eq!(end, utc(2026, 2, 10, 22, 59, 59));
    }

    #[test]
    fn cross_midnight_window_ends_tomorrow() {
        let mut night = rule();
        night.weekdays = None;
        night.time_start = NaiveTime::from_hms_opt(22, 0, 0);
        night.time_end = NaiveTime::from_hms_opt(2, 0, 0);

        // 23:00 Warsaw on the 5th: window closes at 02:00 Warsaw on the 6th,
        // i.e. 01:00 UTC.
        let end = window_end(&night, utc(2026, 1, 5, 22, 0, 0)).unwrap();
        assert_eq!(end, utc(2026, 1, 6, 1, 0, 0));

        // 01:00 Warsaw on the 6th: same window, same end.
        let end = window_end(&night, utc(2026, 1, 6, 0, 0, 0)).unwrap();
        assert_eq!(end, utc(2026, 1, 6, 1, 0, 0));
    }

    #[test]
    fn earliest_window_end_takes_minimum() {
        let mut short = rule();
        short.name = Some("Short".to_owned());
        short.time_end = NaiveTime::from_hms_opt(12, 0, 0);

        let rules = vec![rule(), short];
        let end = earliest_window_end(&rules, utc(2026, 2, 10, 9, 0, 0)).unwrap();
        assert_eq!(end, utc(2026, 2, 10, 11, 0, 0)); // 12:00 Warsaw
    }

    #[test]
    fn any_matches_reports_first_matching_name() {
        let mut weekend = rule();
        weekend.name = Some("Weekend".to_owned());
        weekend.weekdays = Some(vec![5, 6]);

        let rules = vec![weekend, rule()];
        let (ok, name) = any_matches(&rules, utc(2026, 2, 10, 9, 0, 0));
        assert!(ok);
        assert_eq!(name, Some("Business hours"));
    }

    #[test]
    fn empty_rule_set_is_always_open() {
        assert_eq!(any_matches(&[], utc(2026, 2, 10, 9, 0, 0)), (true, None));
    }

    #[test]
    fn inactive_rules_are_ignored() {
        let mut inactive = rule();
        inactive.is_active = false;
        let (ok, _) = any_matches(std::slice::from_ref(&inactive), utc(2026, 2, 10, 9, 0, 0));
        assert!(!ok);
        assert!(earliest_window_end(&[inactive], utc(2026, 2, 10, 9, 0, 0)).is_none());
    }

    #[test]
    fn month_and_day_dimensions_filter() {
        let mut may_first_week = rule();
        may_first_week.months = Some(vec![5]);
        may_first_week.days_of_month = Some((1..8).collect());

        // Monday 2026-05-04, 10:00 Warsaw (08:00 UTC, DST).
        assert!(matches(&may_first_week, utc(2026, 5, 4, 8, 0, 0)));
        // Monday 2026-06-01 is outside May.
        assert!(!matches(&may_first_week, utc(2026, 6, 1, 8, 0, 0)));
        // Monday 2026-05-11 is outside the first week.
        assert!(!matches(&may_first_week, utc(2026, 5, 11, 8, 0, 0)));
    }

    #[test]
    fn unknown_timezone_never_matches() {
        let mut bad = rule();
        bad.timezone = "Mars/Olympus".to_owned();
        assert!(!matches(&bad, utc(2026, 2, 10, 9, 0, 0)));
    }

    #[rstest]
    #[case(None, None, "Mon-Fri 08:00-16:00")]
    #[case(Some(vec![5, 6]), None, "Weekends 08:00-16:00")]
    #[case(None, Some(vec![5]), "Mon-Fri May only 08:00-16:00")]
    fn describes_rules(
        #[case] weekdays: Option<Vec<u8>>,
        #[case] months: Option<Vec<u8>>,
        #[case] expected: &str,
    ) {
        let mut r = rule();
        if let Some(weekdays) = weekdays {
            r.weekdays = Some(weekdays);
        }
        r.months = months;
        assert_eq!(describe(&r), expected);
    }
}
