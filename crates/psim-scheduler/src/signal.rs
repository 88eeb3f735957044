//! Small time-series helpers shared by the timing and routing passes
//! (`AddSignalToSum` / `PadToLength` / `FirstNonZeroIndex` in
//! `original_source/src/scheduler/scheduler.cc`).

/// Adds `signal` into `sum`, growing `sum` with zeros if `signal` is longer.
pub fn add_into(signal: &[f64], sum: &mut Vec<f64>) {
    if sum.len() < signal.len() {
        sum.resize(signal.len(), 0.0);
    }
    for (i, v) in signal.iter().enumerate() {
        sum[i] += v;
    }
}

pub fn first_nonzero_index(values: &[f64]) -> Option<usize> {
    values.iter().position(|v| *v != 0.0)
}

pub fn last_nonzero_index(values: &[f64]) -> Option<usize> {
    values.iter().rposition(|v| *v != 0.0)
}

/// The rack-link direction a flow's load is attributed to: the source
/// rack's uplink for an "up" flow, the destination rack's downlink for a
/// "down" flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn parse(s: &str) -> Direction {
        if s.eq_ignore_ascii_case("down") {
            Direction::Down
        } else {
            Direction::Up
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RackLink {
    pub rack: i64,
    pub dir: Direction,
}

/// Fixed-point key for `f64` throttle rates so they can be used as
/// `HashMap` keys (mirrors the original's `std::unordered_map<double, ...>`,
/// which relies on the rates always coming from the same small candidate
/// list so bitwise equality holds; we round to avoid relying on that).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThrottleKey(i64);

impl ThrottleKey {
    pub fn from_rate(rate: f64) -> Self {
        ThrottleKey((rate * 1000.0).round() as i64)
    }

    pub fn rate(self) -> f64 {
        self.0 as f64 / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_into_grows_and_sums() {
        let mut sum = vec![1.0, 2.0];
        add_into(&[1.0, 1.0, 1.0], &mut sum);
        assert_eq!(sum, vec![2.0, 3.0, 1.0]);
    }

    #[test]
    fn throttle_key_round_trips() {
        let k = ThrottleKey::from_rate(0.75);
        assert_eq!(k.rate(), 0.75);
        assert_eq!(ThrottleKey::from_rate(1.0), ThrottleKey::from_rate(1.0));
    }
}
