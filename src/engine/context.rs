// Context predicate evaluation - time_of_day, day_of_week and caller-supplied keys

use chrono::{DateTime, Datelike, Local, Timelike};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Time source for context conditions. Injected so tests pin the clock.
pub trait Clock: Send + Sync {
    fn now_local(&self) -> DateTime<Local>;
}

/// Wall-clock time in the local timezone.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_local(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// A fixed clock for tests.
pub struct FixedClock(pub DateTime<Local>);

impl Clock for FixedClock {
    fn now_local(&self) -> DateTime<Local> {
        self.0
    }
}

const WEEK: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// Evaluates `when.context` conditions.
///
/// Two built-in keys (`time_of_day`, `day_of_week`) consult the clock;
/// every other key is matched against the caller-supplied context map.
/// All conditions must hold (AND logic).
#[derive(Clone)]
pub struct ContextEvaluator {
    clock: Arc<dyn Clock>,
}

impl Default for ContextEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextEvaluator {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn evaluate(
        &self,
        conditions: &BTreeMap<String, Value>,
        context: Option<&Map<String, Value>>,
    ) -> bool {
        conditions
            .iter()
            .all(|(key, expected)| self.evaluate_one(key, expected, context))
    }

    fn evaluate_one(
        &self,
        key: &str,
        expected: &Value,
        context: Option<&Map<String, Value>>,
    ) -> bool {
        match key {
            "time_of_day" => match expected.as_str() {
                Some(spec) => self.check_time_of_day(spec),
                None => false,
            },
            "day_of_week" => match expected.as_str() {
                Some(spec) => self.check_day_of_week(spec),
                None => false,
            },
            _ => Self::check_value(key, expected, context),
        }
    }

    // -- time_of_day: "HH:MM-HH:MM", inclusive, wraps midnight ----------

    fn check_time_of_day(&self, spec: &str) -> bool {
        let (negated, range) = split_negation(spec);
        let Some((start, end)) = parse_time_range(range) else {
            warn!(spec, "Invalid time_of_day condition");
            return false;
        };
        let now = self.clock.now_local();
        let minutes = now.hour() * 60 + now.minute();
        let inside = if end < start {
            // Range wraps midnight, e.g. 22:00-06:00
            minutes >= start || minutes <= end
        } else {
            minutes >= start && minutes <= end
        };
        inside != negated
    }

    // -- day_of_week: "Mon-Fri" range or "Sat,Sun" list -----------------

    fn check_day_of_week(&self, spec: &str) -> bool {
        let (negated, days) = split_negation(spec);
        let today = self.clock.now_local().weekday().num_days_from_monday() as usize;
        let Some(inside) = day_spec_contains(days, today) else {
            warn!(spec, "Invalid day_of_week condition");
            return false;
        };
        inside != negated
    }

    // -- arbitrary keys -------------------------------------------------

    fn check_value(key: &str, expected: &Value, context: Option<&Map<String, Value>>) -> bool {
        let actual = context.and_then(|c| c.get(key));

        // List → membership
        if let Some(options) = expected.as_array() {
            return match actual {
                Some(actual) => options.iter().any(|opt| values_equal(opt, actual)),
                None => false,
            };
        }

        // "!value" → inequality; missing key passes
        if let Some(s) = expected.as_str() {
            if let Some(rest) = s.strip_prefix('!') {
                return match actual {
                    Some(actual) => !string_equals(rest, actual),
                    None => true,
                };
            }
        }

        // Scalar → equality; missing key fails
        match actual {
            Some(actual) => values_equal(expected, actual),
            None => false,
        }
    }
}

fn split_negation(spec: &str) -> (bool, &str) {
    match spec.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, spec),
    }
}

fn parse_time_range(range: &str) -> Option<(u32, u32)> {
    let (start, end) = range.split_once('-')?;
    Some((parse_hhmm(start.trim())?, parse_hhmm(end.trim())?))
}

fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

fn day_index(name: &str) -> Option<usize> {
    WEEK.iter().position(|d| d.eq_ignore_ascii_case(name.trim()))
}

/// Whether `today` (0 = Mon) falls inside a "Mon-Fri" range or
/// "Sat,Sun" comma list. None on parse failure.
fn day_spec_contains(spec: &str, today: usize) -> Option<bool> {
    if let Some((from, to)) = spec.split_once('-') {
        let from = day_index(from)?;
        let to = day_index(to)?;
        // Declared week order Mon–Sun; a reversed range wraps the weekend
        return Some(if from <= to {
            today >= from && today <= to
        } else {
            today >= from || today <= to
        });
    }
    let mut found = false;
    for part in spec.split(',') {
        let idx = day_index(part)?;
        if idx == today {
            found = true;
        }
    }
    Some(found)
}

fn values_equal(expected: &Value, actual: &Value) -> bool {
    if expected == actual {
        return true;
    }
    // Tolerate string/scalar mismatches from YAML vs JSON contexts
    match (expected.as_str(), actual.as_str()) {
        (Some(e), None) => e == actual.to_string(),
        (None, Some(a)) => expected.to_string() == a,
        _ => false,
    }
}

fn string_equals(expected: &str, actual: &Value) -> bool {
    match actual.as_str() {
        Some(a) => a == expected,
        None => actual.to_string() == expected,
    }
}
