// Convert wire values into normalized numbers.
// Venues disagree on encoding: JSON numbers, numeric strings, "NaN", empty strings.

use serde_json::Value;

/// Exact decimal <-> scaled integer conversion.
pub struct Normaliser {
    pub price_scale: i64, // e.g. 1_000 => 3 decimal places
}

impl Normaliser {
    pub fn new(price_scale: i64) -> Self {
        Self { price_scale }
    }

    fn scale_power(&self) -> usize {
        self.price_scale.to_string().len() - 1 // e.g., 1000 -> 3
    }

    /// Parse a decimal string into ticks without going through floating point.
    /// Returns `None` for anything that is not a plain non-negative decimal, or
    /// when digits beyond the scale are non-zero.
    pub fn price_to_ticks(&self, s: &str) -> Option<i64> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        let (integer_part, decimal_part) = match s.find('.') {
            Some(dot_pos) => (&s[..dot_pos], &s[dot_pos + 1..]),
            None => (s, ""),
        };
        if integer_part.is_empty() && decimal_part.is_empty() {
            return None;
        }
        let all_digits = |p: &str| p.bytes().all(|b| b.is_ascii_digit());
        if !all_digits(integer_part) || !all_digits(decimal_part) {
            return None;
        }

        let integer: i64 = if integer_part.is_empty() { 0 } else { integer_part.parse().ok()? };

        let scale_power = self.scale_power();
        let decimal: i64 = if decimal_part.is_empty() {
            0
        } else if decimal_part.len() >= scale_power {
            // Extra precision must be zeros, otherwise the value is not representable
            if decimal_part[scale_power..].bytes().any(|b| b != b'0') {
                return None;
            }
            if scale_power == 0 { 0 } else { decimal_part[..scale_power].parse().ok()? }
        } else {
            let padded = format!("{:0<width$}", decimal_part, width = scale_power);
            padded.parse().ok()?
        };

        integer.checked_mul(self.price_scale)?.checked_add(decimal)
    }

    /// Render ticks back as the shortest decimal string ("500", "502.5").
    pub fn ticks_to_string(&self, ticks: i64) -> String {
        let integer = ticks / self.price_scale;
        let frac = (ticks % self.price_scale).abs();
        if frac == 0 {
            return integer.to_string();
        }
        let digits = format!("{:0width$}", frac, width = self.scale_power());
        format!("{}.{}", integer, digits.trim_end_matches('0'))
    }

    /// Nearest-tick conversion for values that arrive as floats.
    pub fn f64_to_ticks(&self, v: f64) -> i64 {
        (v * self.price_scale as f64).round() as i64
    }

    pub fn ticks_to_f64(&self, ticks: i64) -> f64 {
        ticks as f64 / self.price_scale as f64
    }
}

/// Numeric field that may be a JSON number or a numeric string. NaN maps to `None`.
pub fn num(v: &Value) -> Option<f64> {
    let x = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if x.is_finite() { Some(x) } else { None }
}

/// Non-negative integer quantity (sizes, volumes, open interest).
pub fn qty(v: &Value) -> Option<u64> {
    let x = num(v)?;
    if x < 0.0 { None } else { Some(x.round() as u64) }
}

pub fn field_num(obj: &Value, key: &str) -> Option<f64> {
    obj.get(key).and_then(num)
}

pub fn field_qty(obj: &Value, key: &str) -> Option<u64> {
    obj.get(key).and_then(qty)
}

pub fn field_str<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

/// Epoch milliseconds from a number, a numeric string or an RFC 3339 timestamp.
pub fn epoch_ms(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok().or_else(|| {
            chrono::DateTime::parse_from_rfc3339(s.trim()).ok().map(|dt| dt.timestamp_millis())
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_price_to_ticks() {
        let n = Normaliser::new(1_000);
        assert_eq!(n.price_to_ticks("500"), Some(500_000));
        assert_eq!(n.price_to_ticks("502.5"), Some(502_500));
        assert_eq!(n.price_to_ticks(" 0.125 "), Some(125));
        assert_eq!(n.price_to_ticks("12.50000"), Some(12_500));
        assert_eq!(n.price_to_ticks(".5"), Some(500));
        assert_eq!(n.price_to_ticks("12.0001"), None);
        assert_eq!(n.price_to_ticks("-5"), None);
        assert_eq!(n.price_to_ticks("abc"), None);
        assert_eq!(n.price_to_ticks(""), None);
        assert_eq!(n.price_to_ticks("."), None);
    }

    #[test]
    fn test_ticks_to_string() {
        let n = Normaliser::new(1_000);
        assert_eq!(n.ticks_to_string(500_000), "500");
        assert_eq!(n.ticks_to_string(502_500), "502.5");
        assert_eq!(n.ticks_to_string(125), "0.125");
        assert_eq!(n.ticks_to_string(1_010), "1.01");
    }

    #[test]
    fn test_wire_numbers() {
        assert_eq!(num(&json!(1.5)), Some(1.5));
        assert_eq!(num(&json!("281.1499")), Some(281.1499));
        assert_eq!(num(&json!("NaN")), None);
        assert_eq!(num(&json!("")), None);
        assert_eq!(num(&Value::Null), None);
        assert_eq!(qty(&json!("100")), Some(100));
        assert_eq!(qty(&json!(-3)), None);
        assert_eq!(epoch_ms(&json!("1557757189000")), Some(1_557_757_189_000));
        assert_eq!(epoch_ms(&json!("2024-01-19T14:30:00Z")), Some(1_705_674_600_000));
    }
}
