//! Timing utilities: the tick stream that paces claim attempts, and interval
//! parsing for the configuration surface.

use futures::Stream;
use pin_project_lite::pin_project;

/// Interval both the client's polls and the worker's backoff default to.
pub(crate) const DEFAULT_DELAY: std::time::Duration = std::time::Duration::from_millis(1000);

pin_project! {
    /// Fixed-period stream that wakes the worker to attempt claims.
    ///
    /// Resets on ready rather than on poll, so a consumer that stalls
    /// briefly does not accumulate drift.
    pub struct Ticker {
        #[pin]
        inner: futures_timer::Delay,
        period: std::time::Duration,
    }
}

impl Ticker {
    pub fn new(period: std::time::Duration) -> Self {
        Self {
            inner: futures_timer::Delay::new(period),
            period,
        }
    }
}

impl Stream for Ticker {
    type Item = ();

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let mut this = self.project();
        let poll = this.inner.as_mut().poll(cx);
        if poll.is_ready() {
            this.inner.reset(*this.period);
        }
        poll.map(Some)
    }
}

/// An interval the caller could not express as a positive duration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalError {
    input: String,
}

impl std::fmt::Display for IntervalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid interval {:?}: expected a positive duration such as \"500ms\", \"2s\", \"5m\" or \"1h\"", self.input)
    }
}

impl std::error::Error for IntervalError {}

/// Conversion into a poll or backoff interval.
///
/// Accepts a [`std::time::Duration`] or a shorthand string: bare
/// milliseconds (`"1500"`) or an integer with a unit suffix (`"500ms"`,
/// `"2s"`, `"5m"`, `"1h"`). Zero is rejected everywhere: a zero interval
/// turns the idle wait into a busy spin.
pub trait IntoInterval {
    fn into_interval(self) -> Result<std::time::Duration, IntervalError>;
}

impl IntoInterval for std::time::Duration {
    fn into_interval(self) -> Result<std::time::Duration, IntervalError> {
        if self.is_zero() {
            return Err(IntervalError {
                input: "0".to_owned(),
            });
        }
        Ok(self)
    }
}

impl IntoInterval for &str {
    fn into_interval(self) -> Result<std::time::Duration, IntervalError> {
        parse_interval(self).ok_or_else(|| IntervalError {
            input: self.to_owned(),
        })
    }
}

impl IntoInterval for String {
    fn into_interval(self) -> Result<std::time::Duration, IntervalError> {
        self.as_str().into_interval()
    }
}

fn parse_interval(text: &str) -> Option<std::time::Duration> {
    let text = text.trim();
    let digits = text.len() - text.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    let (value, unit) = text.split_at(digits);
    let value: u64 = value.parse().ok()?;
    let millis = match unit.trim() {
        "" | "ms" => value,
        "s" => value.checked_mul(1_000)?,
        "m" => value.checked_mul(60_000)?,
        "h" => value.checked_mul(3_600_000)?,
        _ => return None,
    };
    if millis == 0 {
        return None;
    }
    Some(std::time::Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn shorthand_strings_parse() {
        let table = [
            ("250", Duration::from_millis(250)),
            ("500ms", Duration::from_millis(500)),
            ("2s", Duration::from_secs(2)),
            ("5m", Duration::from_secs(300)),
            ("1h", Duration::from_secs(3600)),
            (" 3s ", Duration::from_secs(3)),
        ];
        for (text, expected) in table {
            assert_eq!(text.into_interval().unwrap(), expected, "{text:?}");
        }
    }

    #[test]
    fn durations_pass_through() {
        assert_eq!(
            Duration::from_millis(42).into_interval().unwrap(),
            Duration::from_millis(42)
        );
    }

    #[test]
    fn zero_and_garbage_are_rejected() {
        assert!("0".into_interval().is_err());
        assert!("0s".into_interval().is_err());
        assert!(Duration::ZERO.into_interval().is_err());
        assert!("".into_interval().is_err());
        assert!("fast".into_interval().is_err());
        assert!("2 fortnights".into_interval().is_err());
        assert!("-5s".into_interval().is_err());
    }
}
