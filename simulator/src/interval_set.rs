use std::fmt;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseIntervalError {
    #[error("invalid interval element '{0}': not an unsigned integer")]
    BadElement(String),
    #[error("invalid interval '{0}': left bound exceeds right bound")]
    ReversedBounds(String),
}

/// A set of machine indices stored as sorted, disjoint, closed intervals.
///
/// This is the allocation currency of the whole simulator: job allocations,
/// reservation allocations and resource-state changes are all interval sets,
/// and the wire format uses the hyphen-run representation ("0-2 5 7-8").
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IntervalSet {
    intervals: Vec<(u32, u32)>,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_range(left: u32, right: u32) -> Self {
        assert!(left <= right, "reversed interval bounds");
        Self {
            intervals: vec![(left, right)],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Number of elements (not intervals) in the set.
    pub fn size(&self) -> u32 {
        self.intervals.iter().map(|(l, r)| r - l + 1).sum()
    }

    pub fn contains(&self, value: u32) -> bool {
        self.intervals
            .binary_search_by(|&(l, r)| {
                if value < l {
                    std::cmp::Ordering::Greater
                } else if value > r {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    pub fn intersects(&self, other: &IntervalSet) -> bool {
        let mut i = 0;
        let mut j = 0;
        while i < self.intervals.len() && j < other.intervals.len() {
            let (al, ar) = self.intervals[i];
            let (bl, br) = other.intervals[j];
            if ar < bl {
                i += 1;
            } else if br < al {
                j += 1;
            } else {
                return true;
            }
        }
        false
    }

    pub fn insert(&mut self, value: u32) {
        self.insert_range(value, value);
    }

    pub fn insert_range(&mut self, left: u32, right: u32) {
        assert!(left <= right, "reversed interval bounds");
        let mut result: Vec<(u32, u32)> = Vec::with_capacity(self.intervals.len() + 1);
        let mut new = (left, right);
        let mut placed = false;
        for &(l, r) in &self.intervals {
            if placed || r.saturating_add(1) < new.0 {
                result.push((l, r));
            } else if new.1.saturating_add(1) < l {
                result.push(new);
                result.push((l, r));
                placed = true;
            } else {
                // overlapping or adjacent, absorb
                new = (new.0.min(l), new.1.max(r));
            }
        }
        if !placed {
            result.push(new);
        }
        result.sort_unstable();
        self.intervals = result;
    }

    pub fn union(&self, other: &IntervalSet) -> IntervalSet {
        let mut result = self.clone();
        for &(l, r) in &other.intervals {
            result.insert_range(l, r);
        }
        result
    }

    pub fn remove(&mut self, value: u32) {
        let mut result = Vec::with_capacity(self.intervals.len() + 1);
        for &(l, r) in &self.intervals {
            if value < l || value > r {
                result.push((l, r));
            } else {
                if l < value {
                    result.push((l, value - 1));
                }
                if value < r {
                    result.push((value + 1, r));
                }
            }
        }
        self.intervals = result;
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.intervals.iter().flat_map(|&(l, r)| l..=r)
    }

    /// Parses the hyphen-run representation, e.g. "0-2 5 7-8".
    pub fn from_string_hyphen(
        input: &str,
        separator: &str,
        hyphen: &str,
    ) -> Result<Self, ParseIntervalError> {
        let mut set = IntervalSet::new();
        for part in input.split(separator).filter(|p| !p.is_empty()) {
            match part.split_once(hyphen) {
                Some((left, right)) => {
                    let l: u32 = left
                        .trim()
                        .parse()
                        .map_err(|_| ParseIntervalError::BadElement(part.to_string()))?;
                    let r: u32 = right
                        .trim()
                        .parse()
                        .map_err(|_| ParseIntervalError::BadElement(part.to_string()))?;
                    if l > r {
                        return Err(ParseIntervalError::ReversedBounds(part.to_string()));
                    }
                    set.insert_range(l, r);
                }
                None => {
                    let v: u32 = part
                        .trim()
                        .parse()
                        .map_err(|_| ParseIntervalError::BadElement(part.to_string()))?;
                    set.insert(v);
                }
            }
        }
        Ok(set)
    }

    pub fn to_string_hyphen(&self, separator: &str, hyphen: &str) -> String {
        self.intervals
            .iter()
            .map(|&(l, r)| {
                if l == r {
                    l.to_string()
                } else {
                    format!("{}{}{}", l, hyphen, r)
                }
            })
            .collect::<Vec<_>>()
            .join(separator)
    }
}

impl fmt::Display for IntervalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_hyphen(" ", "-"))
    }
}

impl FromIterator<u32> for IntervalSet {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        let mut set = IntervalSet::new();
        for v in iter {
            set.insert(v);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_merges_adjacent_and_overlapping() {
        let mut set = IntervalSet::new();
        set.insert_range(0, 2);
        set.insert(3);
        set.insert_range(7, 8);
        set.insert_range(5, 7);
        assert_eq!(set.to_string_hyphen(" ", "-"), "0-3 5-8");
        assert_eq!(set.size(), 8);
    }

    #[test]
    fn parse_and_format_round_trip() {
        let set = IntervalSet::from_string_hyphen("0-2 5 7-8", " ", "-").unwrap();
        assert_eq!(set.size(), 6);
        assert!(set.contains(1));
        assert!(set.contains(5));
        assert!(!set.contains(6));
        assert_eq!(set.to_string_hyphen(" ", "-"), "0-2 5 7-8");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(IntervalSet::from_string_hyphen("a-b", " ", "-").is_err());
        assert!(IntervalSet::from_string_hyphen("5-2", " ", "-").is_err());
    }

    #[test]
    fn remove_splits_interval() {
        let mut set = IntervalSet::from_range(0, 4);
        set.remove(2);
        assert_eq!(set.to_string_hyphen(" ", "-"), "0-1 3-4");
        assert_eq!(set.size(), 4);
    }

    #[test]
    fn intersects_detects_overlap() {
        let a = IntervalSet::from_string_hyphen("0-3", " ", "-").unwrap();
        let b = IntervalSet::from_string_hyphen("3-5", " ", "-").unwrap();
        let c = IntervalSet::from_string_hyphen("4-5", " ", "-").unwrap();
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn iter_yields_sorted_elements() {
        let set = IntervalSet::from_string_hyphen("2 0 5-6", " ", "-").unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 2, 5, 6]);
    }
}
