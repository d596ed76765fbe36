//! Label Templates
//!
//! Formats series labels from start-document fields. Supported forms:
//!
//! - `{field}`: the field value
//! - `{field:.N}`: strings truncated to N characters, numbers rounded to N decimals
//! - `{{` and `}}`: literal braces
//!
//! Missing fields render as `?`. An unterminated `{` is kept verbatim.
//!
//! ```
//! use runview_core::document::RunStart;
//! use runview_core::label::format_label;
//!
//! let start = RunStart::new("3f2a9c1d-0000").with_scan_id(12);
//! assert_eq!(format_label("{scan_id} [{uid:.8}]", &start), "12 [3f2a9c1d]");
//! ```

use serde_json::Value;

use crate::document::RunStart;

/// Default series label
pub const DEFAULT_TEMPLATE: &str = "{scan_id} [{uid:.8}]";

/// Render `template` against a start document
#[must_use]
pub fn format_label(template: &str, start: &RunStart) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut field = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    field.push(inner);
                }

                if closed {
                    out.push_str(&render_field(&field, start));
                } else {
                    out.push('{');
                    out.push_str(&field);
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn render_field(field: &str, start: &RunStart) -> String {
    let (key, spec) = match field.split_once(':') {
        Some((key, spec)) => (key.trim(), Some(spec.trim())),
        None => (field.trim(), None),
    };
    let precision = spec
        .and_then(|s| s.strip_prefix('.'))
        .map(|s| s.trim_end_matches('f'))
        .and_then(|s| s.parse::<usize>().ok());

    let Some(value) = start.field(key) else {
        return "?".to_string();
    };

    match (value, precision) {
        (Value::String(s), Some(n)) => s.chars().take(n).collect(),
        (Value::String(s), None) => s,
        (Value::Number(n), Some(p)) => match n.as_f64() {
            Some(v) => format!("{v:.p$}"),
            None => n.to_string(),
        },
        (Value::Number(n), None) => n.to_string(),
        (Value::Null, _) => "?".to_string(),
        (other, _) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn start() -> RunStart {
        RunStart::new("abcdef0123456789")
            .with_scan_id(42)
            .with_metadata("plan_name", "count")
            .with_metadata("temperature", 293.456)
    }

    #[test]
    fn test_default_template() {
        assert_eq!(format_label(DEFAULT_TEMPLATE, &start()), "42 [abcdef01]");
    }

    #[test]
    fn test_missing_field_renders_placeholder() {
        let start = RunStart::new("u1");
        assert_eq!(format_label("{scan_id} [{uid:.8}]", &start), "? [u1]");
        assert_eq!(format_label("{sample:.3}", &start), "?");
    }

    #[test]
    fn test_number_precision() {
        assert_eq!(format_label("{temperature:.1}", &start()), "293.5");
        assert_eq!(format_label("{temperature:.2f} K", &start()), "293.46 K");
        assert_eq!(format_label("{temperature}", &start()), "293.456");
    }

    #[test]
    fn test_escapes_and_unterminated() {
        assert_eq!(format_label("{{{plan_name}}}", &start()), "{count}");
        assert_eq!(format_label("scan {plan_name", &start()), "scan {plan_name");
        assert_eq!(format_label("plain text", &start()), "plain text");
    }

    #[test]
    fn test_non_string_metadata() {
        let start = RunStart::new("u1").with_metadata("motors", json!(["x", "y"]));
        assert_eq!(format_label("{motors}", &start), r#"["x","y"]"#);
    }
}
