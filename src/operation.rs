use std::fmt;

use crate::error::{Result, ScanError};

/// Binary operator applied by the scan.
///
/// Arithmetic wraps on overflow so every worker computes the same bits.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Operation {
    Add = 1,
    Subtract = 2,
    Multiply = 3,
    Max = 4,
    Min = 5,
    Gcd = 6,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::Add,
        Operation::Subtract,
        Operation::Multiply,
        Operation::Max,
        Operation::Min,
        Operation::Gcd,
    ];

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|op| op.code() == code)
            .ok_or_else(|| ScanError::input(format!("unknown operation code {code} (expected 1-6)")))
    }

    /// Subtract is the only operator here that is not associative; the scan
    /// still runs it and the result is not a sequential prefix difference.
    pub fn is_associative(self) -> bool {
        !matches!(self, Operation::Subtract)
    }

    #[inline]
    pub fn combine(self, a: i32, b: i32) -> i32 {
        match self {
            Operation::Add => a.wrapping_add(b),
            Operation::Subtract => a.wrapping_sub(b),
            Operation::Multiply => a.wrapping_mul(b),
            Operation::Max => a.max(b),
            Operation::Min => a.min(b),
            Operation::Gcd => gcd(a, b),
        }
    }

    /// Sequential left fold of `combine` over every prefix of `input`.
    pub fn fold_prefixes(self, input: &[i32]) -> Vec<i32> {
        input
            .iter()
            .scan(None, |acc: &mut Option<i32>, &x| {
                let next = match *acc {
                    Some(prev) => self.combine(prev, x),
                    None => x,
                };
                *acc = Some(next);
                Some(next)
            })
            .collect()
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Add => "add",
            Operation::Subtract => "subtract",
            Operation::Multiply => "multiply",
            Operation::Max => "max",
            Operation::Min => "min",
            Operation::Gcd => "gcd",
        };
        f.write_str(name)
    }
}

/// Euclidean reduction over magnitudes. `gcd(a, 0) == |a|`, except that
/// `|i32::MIN|` does not fit and wraps back to `i32::MIN`.
pub fn gcd(a: i32, b: i32) -> i32 {
    let (mut a, mut b) = (a.unsigned_abs(), b.unsigned_abs());
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for op in Operation::ALL {
            assert_eq!(Operation::from_code(op.code()).unwrap(), op);
        }
        assert!(Operation::from_code(0).is_err());
        assert!(Operation::from_code(7).is_err());
    }

    #[test]
    fn gcd_works() {
        assert_eq!(gcd(12, 18), 6);
        assert_eq!(gcd(18, 12), 6);
        assert_eq!(gcd(7, 0), 7);
        assert_eq!(gcd(0, 7), 7);
        assert_eq!(gcd(0, 0), 0);
        assert_eq!(gcd(17, 5), 1);
        assert_eq!(gcd(-12, 18), 6);
    }

    #[test]
    fn gcd_of_min_wraps() {
        assert_eq!(gcd(i32::MIN, 0), i32::MIN);
        assert_eq!(gcd(0, i32::MIN), i32::MIN);
        assert_eq!(gcd(i32::MIN, 6), 2);
        assert_eq!(Operation::Gcd.combine(i32::MIN, i32::MIN), i32::MIN);
    }

    #[test]
    fn fold_prefixes_is_left_fold() {
        assert_eq!(Operation::Add.fold_prefixes(&[1, 2, 3, 4, 5]), vec![1, 3, 6, 10, 15]);
        assert_eq!(Operation::Subtract.fold_prefixes(&[10, 3, 2]), vec![10, 7, 5]);
        assert_eq!(Operation::Min.fold_prefixes(&[]), Vec::<i32>::new());
    }

    #[test]
    fn arithmetic_wraps() {
        assert_eq!(Operation::Add.combine(i32::MAX, 1), i32::MIN);
        assert_eq!(Operation::Multiply.combine(i32::MAX, 2), -2);
    }
}
