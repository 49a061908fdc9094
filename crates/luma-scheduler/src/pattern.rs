//! Minute-pattern matching for time event directories
//!
//! Patterns are directory names under `<config>/events/time/`, normalised
//! as `HH_MM` with `*` wildcards on either side. Sunrise/sunset offsets
//! are sibling directories named `[+-]HH_MM`. Parsing is plain string
//! splitting; nothing here runs a regex.

/// A parsed clock pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimePattern {
    /// `*_*` — every minute.
    EveryMinute,
    /// `*_MM` — a specific minute of every hour.
    MinuteOfHour(u32),
    /// `HH_*` — every minute of a specific hour.
    HourOfDay(u32),
    /// `HH_MM` — the literal clock.
    Exact { hour: u32, minute: u32 },
}

impl TimePattern {
    /// Parse a directory name into a pattern. Returns `None` for names
    /// that are not clock patterns (including `sunrise`/`sunset`).
    pub fn parse(name: &str) -> Option<TimePattern> {
        let (hour_part, minute_part) = name.split_once('_')?;

        match (hour_part, minute_part) {
            ("*", "*") => Some(TimePattern::EveryMinute),
            ("*", m) => Some(TimePattern::MinuteOfHour(parse_component(m, 59)?)),
            (h, "*") => Some(TimePattern::HourOfDay(parse_component(h, 23)?)),
            (h, m) => Some(TimePattern::Exact {
                hour: parse_component(h, 23)?,
                minute: parse_component(m, 59)?,
            }),
        }
    }

    /// Whether the pattern matches the given local clock position.
    pub fn matches(&self, hour: u32, minute: u32) -> bool {
        match self {
            TimePattern::EveryMinute => true,
            TimePattern::MinuteOfHour(m) => *m == minute,
            TimePattern::HourOfDay(h) => *h == hour,
            TimePattern::Exact { hour: h, minute: m } => *h == hour && *m == minute,
        }
    }

    /// Position in the per-tick emission order.
    pub fn rank(&self) -> u8 {
        match self {
            TimePattern::EveryMinute => 0,
            TimePattern::MinuteOfHour(_) => 1,
            TimePattern::HourOfDay(_) => 2,
            TimePattern::Exact { .. } => 3,
        }
    }
}

/// Parse a `[+-]HH_MM` offset directory name into signed minutes.
pub fn parse_offset(name: &str) -> Option<i32> {
    let (sign, rest) = match name.as_bytes().first()? {
        b'+' => (1, &name[1..]),
        b'-' => (-1, &name[1..]),
        _ => return None,
    };

    let (hour_part, minute_part) = rest.split_once('_')?;
    if hour_part.len() != 2 || minute_part.len() != 2 {
        return None;
    }
    let hours: i32 = hour_part.parse().ok()?;
    let minutes: i32 = minute_part.parse().ok()?;
    if minutes > 59 {
        return None;
    }

    Some(sign * (hours * 60 + minutes))
}

fn parse_component(s: &str, max: u32) -> Option<u32> {
    if s.is_empty() || s.len() > 2 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n: u32 = s.parse().ok()?;
    (n <= max).then_some(n)
}
