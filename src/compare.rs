//! Line comparators.

use std::cmp::Ordering;

/// Line comparator interface. Defines a total order over raw line contents (terminators excluded).
pub trait LineCompare: Send + Sync + 'static {
    /// Compares two lines.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

impl<F> LineCompare for F
where
    F: Fn(&[u8], &[u8]) -> Ordering + Send + Sync + 'static,
{
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self(a, b)
    }
}

/// Comparator for lines shaped like `<digits><separator><text>`, for example `"415. Apple"`.
///
/// Lines are ordered by the text following the leading digit run first (ordinal UTF-16 code unit order,
/// a strict prefix sorts before the longer text). Lines with identical text are ordered by the numeric value
/// of the leading digits. A line without leading digits has the numeric value 0, an all-digit line
/// has an empty text part.
#[derive(Debug, Clone, Copy, Default)]
pub struct NumericPrefixComparator;

impl NumericPrefixComparator {
    pub fn new() -> Self {
        NumericPrefixComparator
    }
}

impl LineCompare for NumericPrefixComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let (a_number, a_text) = split_numeric_prefix(a);
        let (b_number, b_text) = split_numeric_prefix(b);

        compare_text(a_text, b_text).then_with(|| compare_numbers(a_number, b_number))
    }
}

/// Compares texts by UTF-16 code units. Byte order agrees with it except for characters
/// U+E000..U+FFFF against supplementary ones, which are only decoded at the first mismatch.
/// Invalid UTF-8 is compared by bytes.
fn compare_text(a: &[u8], b: &[u8]) -> Ordering {
    let mismatch = match a.iter().zip(b).position(|(a, b)| a != b) {
        Some(mismatch) => mismatch,
        None => return a.len().cmp(&b.len()),
    };
    if a[mismatch].is_ascii() || b[mismatch].is_ascii() {
        return a[mismatch].cmp(&b[mismatch]);
    }

    let mut start = mismatch;
    while start > 0 && is_continuation(a[start]) {
        start -= 1;
    }

    match (std::str::from_utf8(&a[start..]), std::str::from_utf8(&b[start..])) {
        (Ok(a), Ok(b)) => a.encode_utf16().cmp(b.encode_utf16()),
        _ => a[mismatch..].cmp(&b[mismatch..]),
    }
}

fn is_continuation(byte: u8) -> bool {
    byte & 0b1100_0000 == 0b1000_0000
}

/// Splits a line into its maximal leading run of ASCII digits and the remaining text.
pub fn split_numeric_prefix(line: &[u8]) -> (&[u8], &[u8]) {
    let prefix_end = line.iter().position(|c| !c.is_ascii_digit()).unwrap_or(line.len());
    line.split_at(prefix_end)
}

/// Compares two ASCII digit runs by numeric value without overflowing.
fn compare_numbers(a: &[u8], b: &[u8]) -> Ordering {
    let a = strip_leading_zeros(a);
    let b = strip_leading_zeros(b);

    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn strip_leading_zeros(digits: &[u8]) -> &[u8] {
    let start = digits.iter().position(|&c| c != b'0').unwrap_or(digits.len());
    &digits[start..]
}
