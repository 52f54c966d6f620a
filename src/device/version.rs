//! Dotted version comparison.

use std::cmp::Ordering;

/// Compare dot-separated numeric versions field by field.
///
/// Missing fields count as 0, so `"17"` equals `"17.0.0"`. A field that is
/// not a number also counts as 0.
pub fn compare(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.trim()
            .split('.')
            .map(|field| field.trim().parse().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let width = a.len().max(b.len());

    for i in 0..width {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// `version >= minimum`
pub fn is_at_least(version: &str, minimum: &str) -> bool {
    compare(version, minimum) != Ordering::Less
}
