//! Timestamp parsing with Go-style reference layouts.
//!
//! Programs describe timestamp formats by writing out the reference time
//! `Mon Jan 2 15:04:05 MST 2006` in the desired shape. Layouts are
//! translated to chrono format strings before parsing.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use std::fmt;

/// Go layout elements and their chrono equivalents, longest first where
/// one is a prefix of another.
const LAYOUT_ELEMENTS: &[(&str, &str)] = &[
    ("January", "%B"),
    ("Jan", "%b"),
    ("Monday", "%A"),
    ("Mon", "%a"),
    ("MST", "%Z"),
    ("2006", "%Y"),
    ("Z07:00", "%:z"),
    ("-07:00", "%:z"),
    ("-0700", "%z"),
    ("Z0700", "%z"),
    ("15", "%H"),
    ("06", "%y"),
    ("01", "%m"),
    ("02", "%d"),
    ("_2", "%e"),
    ("03", "%I"),
    ("04", "%M"),
    ("05", "%S"),
    ("PM", "%p"),
    ("pm", "%p"),
    ("1", "%m"),
    ("2", "%d"),
    ("3", "%I"),
    ("4", "%M"),
    ("5", "%S"),
];

/// Translates a Go reference layout into a chrono format string.
pub fn translate_layout(layout: &str) -> String {
    let mut out = String::with_capacity(layout.len() * 2);
    let mut rest = layout;
    'outer: while let Some(c) = rest.chars().next() {
        // Fractional seconds: `.000`, `,000`, `.999` and so on.
        if (c == '.' || c == ',') && rest.len() > 1 {
            let digits = rest[1..]
                .chars()
                .take_while(|d| *d == '0' || *d == '9')
                .count();
            if digits > 0 {
                out.push_str("%.f");
                rest = &rest[1 + digits..];
                continue;
            }
        }
        for (element, format) in LAYOUT_ELEMENTS {
            if let Some(tail) = rest.strip_prefix(element) {
                out.push_str(format);
                rest = tail;
                continue 'outer;
            }
        }
        if c == '%' {
            out.push_str("%%");
        } else {
            out.push(c);
        }
        rest = &rest[c.len_utf8()..];
    }
    out
}

/// Parses a fixed UTC offset such as `UTC`, `Z`, `+01:00` or `-0530`.
pub fn parse_offset(s: &str) -> Result<FixedOffset, String> {
    let s = s.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("utc") || s == "Z" {
        return FixedOffset::east_opt(0).ok_or_else(|| "invalid offset".to_string());
    }
    let (sign, digits) = match s.as_bytes()[0] {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return Err(format!("timezone {:?} is not a UTC offset like +01:00", s)),
    };
    let digits: String = digits.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) || !matches!(digits.len(), 2 | 4) {
        return Err(format!("timezone {:?} is not a UTC offset like +01:00", s));
    }
    let hours: i32 = digits[..2].parse().map_err(|e| format!("{}", e))?;
    let minutes: i32 = if digits.len() == 4 {
        digits[2..].parse().map_err(|e| format!("{}", e))?
    } else {
        0
    };
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| format!("timezone {:?} is out of range", s))
}

/// Where timestamps without an offset are interpreted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Location {
    Fixed(FixedOffset),
    /// An IANA zone such as `Europe/Berlin`, with daylight saving rules.
    Named(Tz),
}

impl Location {
    /// Accepts a fixed offset (`UTC`, `+01:00`) or an IANA zone name.
    pub fn parse(s: &str) -> Result<Self, String> {
        if let Ok(offset) = parse_offset(s) {
            return Ok(Location::Fixed(offset));
        }
        s.trim()
            .parse::<Tz>()
            .map(Location::Named)
            .map_err(|_| format!("timezone {:?} is neither a UTC offset nor a known zone name", s))
    }

    /// The instant `naive` names in this location.
    ///
    /// Ambiguous local times take the earlier instant. Local times skipped by
    /// a daylight saving jump use the offset in effect just before it.
    pub fn resolve(&self, naive: &NaiveDateTime) -> Option<DateTime<Utc>> {
        match self {
            Location::Fixed(offset) => offset
                .from_local_datetime(naive)
                .single()
                .map(|t| t.with_timezone(&Utc)),
            Location::Named(tz) => match tz.from_local_datetime(naive).earliest() {
                Some(t) => Some(t.with_timezone(&Utc)),
                None => {
                    let before = tz
                        .offset_from_utc_datetime(&(*naive - chrono::Duration::hours(12)))
                        .fix();
                    before
                        .from_local_datetime(naive)
                        .single()
                        .map(|t| t.with_timezone(&Utc))
                }
            },
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Fixed(offset) => write!(f, "{}", offset),
            Location::Named(tz) => write!(f, "{}", tz.name()),
        }
    }
}

/// Parses `value` according to the Go layout `layout`.
///
/// Layouts without a zone are interpreted in `zone`. Layouts without a year
/// get the current year when `use_current_year` is set, and year 0
/// otherwise.
pub fn strptime(
    value: &str,
    layout: &str,
    zone: Option<Location>,
    use_current_year: bool,
) -> Result<DateTime<Utc>, String> {
    let mut format = translate_layout(layout);
    let mut value = value.to_string();

    if layout.contains("Z07") && value.ends_with('Z') {
        value.pop();
        value.push_str("+00:00");
    }
    if !format.contains("%Y") && !format.contains("%y") {
        let year = if use_current_year { Utc::now().year() } else { 0 };
        format = format!("%Y {}", format);
        value = format!("{} {}", year, value);
    }

    if format.contains("%z") || format.contains("%:z") {
        return DateTime::parse_from_str(&value, &format)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| format!("cannot parse {:?} with layout {:?}: {}", value, layout, e));
    }

    let naive = match NaiveDateTime::parse_from_str(&value, &format) {
        Ok(t) => t,
        Err(e) if e.kind() == chrono::format::ParseErrorKind::NotEnough => {
            NaiveDate::parse_from_str(&value, &format)
                .map(|d| d.and_time(Default::default()))
                .map_err(|e| format!("cannot parse {:?} with layout {:?}: {}", value, layout, e))?
        }
        Err(e) => {
            return Err(format!(
                "cannot parse {:?} with layout {:?}: {}",
                value, layout, e
            ))
        }
    };

    zone.unwrap_or(Location::Fixed(Utc.fix()))
        .resolve(&naive)
        .ok_or_else(|| format!("{:?} is not a valid local time", value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_layout() {
        assert_eq!(translate_layout("2006/01/02 15:04:05"), "%Y/%m/%d %H:%M:%S");
        assert_eq!(translate_layout("Jan _2 15:04:05"), "%b %e %H:%M:%S");
        assert_eq!(
            translate_layout("2006-01-02T15:04:05.000Z07:00"),
            "%Y-%m-%dT%H:%M:%S%.f%:z"
        );
        assert_eq!(translate_layout("02/Jan/2006:15:04:05 -0700"), "%d/%b/%Y:%H:%M:%S %z");
        assert_eq!(translate_layout("100%"), "%m00%%");
    }

    #[test]
    fn test_strptime_utc() {
        let t = strptime("2012/01/18 06:25:00", "2006/01/02 15:04:05", None, false).unwrap();
        assert_eq!(t.to_rfc3339(), "2012-01-18T06:25:00+00:00");
    }

    #[test]
    fn test_strptime_in_zone() {
        let zone = Location::parse("+09:00").unwrap();
        let t = strptime("2012/01/18 06:25:00", "2006/01/02 15:04:05", Some(zone), false).unwrap();
        assert_eq!(t.to_rfc3339(), "2012-01-17T21:25:00+00:00");
    }

    #[test]
    fn test_strptime_in_named_zone_follows_daylight_saving() {
        let berlin = Location::parse("Europe/Berlin").unwrap();
        let layout = "2006/01/02 15:04:05";
        let winter = strptime("2012/01/18 06:25:00", layout, Some(berlin), false).unwrap();
        assert_eq!(winter.to_rfc3339(), "2012-01-18T05:25:00+00:00");
        let summer = strptime("2012/07/18 06:25:00", layout, Some(berlin), false).unwrap();
        assert_eq!(summer.to_rfc3339(), "2012-07-18T04:25:00+00:00");
    }

    #[test]
    fn test_named_zone_gaps_and_overlaps() {
        let berlin = Location::parse("Europe/Berlin").unwrap();
        let layout = "2006-01-02 15:04:05";
        // 02:30 does not exist on the spring-forward day.
        let gap = strptime("2012-03-25 02:30:00", layout, Some(berlin), false).unwrap();
        assert_eq!(gap.to_rfc3339(), "2012-03-25T01:30:00+00:00");
        // 02:30 happens twice on the fall-back day; the first one wins.
        let overlap = strptime("2012-10-28 02:30:00", layout, Some(berlin), false).unwrap();
        assert_eq!(overlap.to_rfc3339(), "2012-10-28T00:30:00+00:00");
    }

    #[test]
    fn test_strptime_with_offset_in_value() {
        let t = strptime(
            "18/Jan/2012:06:25:00 -0500",
            "02/Jan/2006:15:04:05 -0700",
            None,
            false,
        )
        .unwrap();
        assert_eq!(t.to_rfc3339(), "2012-01-18T11:25:00+00:00");
    }

    #[test]
    fn test_strptime_rfc3339_zulu() {
        let t = strptime(
            "2012-01-18T06:25:00.250Z",
            "2006-01-02T15:04:05.000Z07:00",
            None,
            false,
        )
        .unwrap();
        assert_eq!(t.timestamp_millis(), 1326867900250);
    }

    #[test]
    fn test_strptime_without_year() {
        let t = strptime("Jan 18 06:25:00", "Jan _2 15:04:05", None, true).unwrap();
        assert_eq!(t.year(), Utc::now().year());
        let t = strptime("Jan 18 06:25:00", "Jan _2 15:04:05", None, false).unwrap();
        assert_eq!(t.year(), 0);
    }

    #[test]
    fn test_strptime_date_only() {
        let t = strptime("2012-01-18", "2006-01-02", None, false).unwrap();
        assert_eq!(t.to_rfc3339(), "2012-01-18T00:00:00+00:00");
    }

    #[test]
    fn test_strptime_mismatch() {
        assert!(strptime("not a date", "2006/01/02", None, false).is_err());
    }

    #[test]
    fn test_parse_offset() {
        assert_eq!(parse_offset("UTC").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_offset("-0530").unwrap().local_minus_utc(), -(5 * 3600 + 1800));
        assert_eq!(parse_offset("+01").unwrap().local_minus_utc(), 3600);
        assert!(parse_offset("Europe/Berlin").is_err());
    }

    #[test]
    fn test_parse_location() {
        assert!(matches!(Location::parse("UTC"), Ok(Location::Fixed(_))));
        assert!(matches!(Location::parse("+02:00"), Ok(Location::Fixed(_))));
        let berlin = Location::parse("Europe/Berlin").unwrap();
        assert_eq!(berlin.to_string(), "Europe/Berlin");
        assert!(Location::parse("Mars/Olympus").is_err());
    }
}
