//! Order-preserving value encoding for index keys.
//!
//! Index keys embed property values directly, so the byte encoding must sort
//! the way the values compare: nulls first by tag, bools, then numerics
//! (ints and floats interleaved numerically), then strings, then bytes.
//! Range predicates then map to bounded KV scans.
//!
//! Encodings are prefix-free: numerics are fixed-width, strings and bytes are
//! 0x00-escaped and 0x00 0x00 terminated (the tuple-encoding trick), so an
//! equality prefix can never match a longer value.

use crate::model::Value;

// Type tags, ordered by the comparison rank of the type.
const TAG_NULL: u8 = 0x10;
const TAG_BOOL: u8 = 0x20;
const TAG_NUMBER: u8 = 0x30;
const TAG_STRING: u8 = 0x40;
const TAG_BYTES: u8 = 0x50;
const TAG_OTHER: u8 = 0x60;

/// Encode a property value into an order-preserving byte string.
pub fn encode_value(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*b));
        }
        Value::Int(i) => {
            out.push(TAG_NUMBER);
            out.extend_from_slice(&encode_f64(*i as f64));
        }
        Value::Float(f) => {
            out.push(TAG_NUMBER);
            out.extend_from_slice(&encode_f64(*f));
        }
        Value::String(s) => {
            out.push(TAG_STRING);
            encode_terminated(s.as_bytes(), &mut out);
        }
        Value::Bytes(b) => {
            out.push(TAG_BYTES);
            encode_terminated(b, &mut out);
        }
        // Lists, maps and graph values are not range-indexable; a stable
        // (but not order-preserving) rendering keeps equality lookups working.
        other => {
            out.push(TAG_OTHER);
            encode_terminated(other.to_string().as_bytes(), &mut out);
        }
    }
    out
}

/// IEEE-754 total-order trick: flip the sign bit for positives, flip all
/// bits for negatives, then big-endian bytes sort numerically. Negative
/// zero normalizes to zero so equal values encode equally.
fn encode_f64(f: f64) -> [u8; 8] {
    let f = if f == 0.0 { 0.0 } else { f };
    let bits = f.to_bits();
    let ordered = if bits & (1 << 63) == 0 {
        bits ^ (1 << 63)
    } else {
        !bits
    };
    ordered.to_be_bytes()
}

/// Escape embedded 0x00 as 0x00 0xFF and terminate with 0x00 0x00. Keeps
/// byte order while making the encoding self-delimiting.
fn encode_terminated(data: &[u8], out: &mut Vec<u8>) {
    for &b in data {
        out.push(b);
        if b == 0x00 {
            out.push(0xFF);
        }
    }
    out.push(0x00);
    out.push(0x00);
}

/// Smallest encoding strictly greater than every value with this prefix.
/// Used as the exclusive upper bound of range scans.
pub fn upper_bound(mut prefix: Vec<u8>) -> Vec<u8> {
    while let Some(&last) = prefix.last() {
        if last < 0xFF {
            *prefix.last_mut().expect("non-empty") = last + 1;
            return prefix;
        }
        prefix.pop();
    }
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(v: impl Into<Value>) -> Vec<u8> {
        encode_value(&v.into())
    }

    #[test]
    fn test_int_ordering() {
        let mut vals = vec![enc(10i64), enc(-5i64), enc(0i64), enc(3i64), enc(-100i64)];
        vals.sort();
        assert_eq!(
            vals,
            vec![enc(-100i64), enc(-5i64), enc(0i64), enc(3i64), enc(10i64)]
        );
    }

    #[test]
    fn test_int_float_interleave() {
        assert!(enc(1i64) < enc(1.5f64));
        assert!(enc(1.5f64) < enc(2i64));
        assert!(enc(-1.5f64) < enc(-1i64));
        assert_eq!(enc(2i64), enc(2.0f64));
    }

    #[test]
    fn test_string_ordering() {
        assert!(enc("apple") < enc("banana"));
        assert!(enc("a") < enc("ab"));
        assert!(enc("Z") < enc("a"));
    }

    #[test]
    fn test_type_rank() {
        assert!(enc(true) < enc(0i64));
        assert!(enc(9999i64) < enc(""));
        assert!(encode_value(&Value::Null) < enc(false));
    }

    #[test]
    fn test_prefix_free() {
        // "a" must not be a byte-prefix of "ab", or equality scans would
        // match both.
        let a = enc("a");
        let ab = enc("ab");
        assert!(!ab.starts_with(&a));
    }

    #[test]
    fn test_embedded_nul() {
        let with_nul = enc("a\0b");
        let plain = enc("a");
        assert!(plain < with_nul);
    }

    #[test]
    fn test_upper_bound() {
        assert_eq!(upper_bound(vec![1, 2, 3]), vec![1, 2, 4]);
        assert_eq!(upper_bound(vec![1, 0xFF]), vec![2]);
    }

    mod props {
        use proptest::prelude::*;

        use super::enc;

        proptest! {
            // Bounded to the range where i64 → f64 is exact, so the
            // encoding must be strictly monotone.
            #[test]
            fn int_encoding_is_monotone(
                a in -1_000_000_000_000i64..1_000_000_000_000,
                b in -1_000_000_000_000i64..1_000_000_000_000,
            ) {
                prop_assert_eq!(a.cmp(&b), enc(a).cmp(&enc(b)));
            }

            #[test]
            fn string_encoding_preserves_order(a in ".*", b in ".*") {
                prop_assert_eq!(a.cmp(&b), enc(a.clone()).cmp(&enc(b.clone())));
            }

            #[test]
            fn float_encoding_is_monotone(a in -1e12f64..1e12, b in -1e12f64..1e12) {
                let expected = a.partial_cmp(&b).unwrap();
                prop_assert_eq!(expected, enc(a).cmp(&enc(b)));
            }
        }
    }
}
