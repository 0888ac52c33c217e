//! 이벤트 조건 -- `when` 설정 평가
//!
//! ```toml
//! when = { equals = { "http.status" = 500 } }
//! when = { contains = { message = "DEBUG" } }
//! when = { regexp = { message = "^ERR" } }
//! when = { has_fields = ["error.code"] }
//! when = { or = [ { equals = { level = "debug" } }, { not = { has_fields = ["user"] } } ] }
//! ```
//!
//! 한 조건 안의 여러 필드는 AND로 결합됩니다. 정규식은 생성 시 한 번만 컴파일합니다.

use regex::Regex;

use ironbeat_core::error::ProcessorError;
use ironbeat_core::event::{Event, Value};

use super::settings::invalid;

/// 컴파일된 조건
#[derive(Debug, Clone)]
pub enum Condition {
    /// 필드 값이 같음 (정수/실수는 수치 비교)
    Equals(Vec<(String, Value)>),
    /// 문자열 필드(또는 문자열 배열의 원소)가 부분 문자열을 포함
    Contains(Vec<(String, String)>),
    /// 문자열 필드가 정규식에 매칭
    Regexp(Vec<(String, Regex)>),
    /// 필드가 모두 존재
    HasFields(Vec<String>),
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    /// `when` 테이블을 파싱합니다.
    ///
    /// 테이블에는 연산자 키가 정확히 하나 있어야 합니다.
    pub fn from_toml(processor: &str, value: &toml::Value) -> Result<Self, ProcessorError> {
        let table = value
            .as_table()
            .ok_or_else(|| invalid(processor, "condition must be a table"))?;
        let mut entries = table.iter();
        let (op, arg) = match (entries.next(), entries.next()) {
            (Some(entry), None) => entry,
            (None, _) => return Err(invalid(processor, "condition must not be empty")),
            (Some(_), Some(_)) => {
                return Err(invalid(processor, "condition must have exactly one operator"));
            }
        };

        match op.as_str() {
            "equals" => Ok(Self::Equals(
                field_table(processor, op, arg)?
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_toml(v.clone())))
                    .collect(),
            )),
            "contains" => field_table(processor, op, arg)?
                .iter()
                .map(|(k, v)| match v {
                    toml::Value::String(s) => Ok((k.clone(), s.clone())),
                    _ => Err(invalid(processor, format!("contains.{k} must be a string"))),
                })
                .collect::<Result<_, _>>()
                .map(Self::Contains),
            "regexp" => field_table(processor, op, arg)?
                .iter()
                .map(|(k, v)| {
                    let pattern = v
                        .as_str()
                        .ok_or_else(|| invalid(processor, format!("regexp.{k} must be a string")))?;
                    let regex = Regex::new(pattern).map_err(|e| {
                        invalid(processor, format!("invalid regex for field '{k}': {e}"))
                    })?;
                    Ok((k.clone(), regex))
                })
                .collect::<Result<_, _>>()
                .map(Self::Regexp),
            "has_fields" => {
                let items = arg
                    .as_array()
                    .ok_or_else(|| invalid(processor, "has_fields must be an array"))?;
                items
                    .iter()
                    .map(|item| {
                        item.as_str()
                            .map(str::to_owned)
                            .ok_or_else(|| invalid(processor, "has_fields must contain strings"))
                    })
                    .collect::<Result<_, _>>()
                    .map(Self::HasFields)
            }
            "and" | "or" => {
                let items = arg
                    .as_array()
                    .ok_or_else(|| invalid(processor, format!("{op} must be an array")))?;
                if items.is_empty() {
                    return Err(invalid(processor, format!("{op} must not be empty")));
                }
                let conditions = items
                    .iter()
                    .map(|item| Self::from_toml(processor, item))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(if op == "and" {
                    Self::And(conditions)
                } else {
                    Self::Or(conditions)
                })
            }
            "not" => Ok(Self::Not(Box::new(Self::from_toml(processor, arg)?))),
            other => Err(invalid(processor, format!("unknown condition '{other}'"))),
        }
    }

    /// 이벤트에 대해 조건을 평가합니다. 필드가 없으면 매칭 실패입니다.
    pub fn check(&self, event: &Event) -> bool {
        match self {
            Self::Equals(pairs) => pairs.iter().all(|(field, expected)| {
                event
                    .get_value(field)
                    .is_some_and(|actual| values_equal(&actual, expected))
            }),
            Self::Contains(pairs) => pairs.iter().all(|(field, needle)| {
                match event.get_value(field) {
                    Some(Value::String(s)) => s.contains(needle.as_str()),
                    Some(Value::Array(items)) => items
                        .iter()
                        .any(|item| item.as_str().is_some_and(|s| s.contains(needle.as_str()))),
                    _ => false,
                }
            }),
            Self::Regexp(pairs) => pairs.iter().all(|(field, regex)| {
                match event.get_value(field) {
                    Some(Value::String(s)) => regex.is_match(&s),
                    _ => false,
                }
            }),
            Self::HasFields(fields) => fields.iter().all(|f| event.get_value(f).is_some()),
            Self::And(conditions) => conditions.iter().all(|c| c.check(event)),
            Self::Or(conditions) => conditions.iter().any(|c| c.check(event)),
            Self::Not(condition) => !condition.check(event),
        }
    }
}

fn field_table<'a>(
    processor: &str,
    op: &str,
    arg: &'a toml::Value,
) -> Result<&'a toml::Table, ProcessorError> {
    match arg.as_table() {
        Some(t) if !t.is_empty() => Ok(t),
        _ => Err(invalid(
            processor,
            format!("{op} must be a non-empty table of field = value"),
        )),
    }
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => (*a as f64) == *b,
        _ => actual == expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironbeat_core::event::Fields;

    fn cond(s: &str) -> Condition {
        let table: toml::Table = toml::from_str(s).unwrap();
        Condition::from_toml("test", &toml::Value::Table(table)).unwrap()
    }

    fn event() -> Event {
        let mut fields = Fields::new();
        fields.put("message", "ERROR disk full");
        fields.put("http.status", 500_i64);
        fields.put("level", "error");
        fields.put(
            "tags",
            Value::Array(vec![Value::from("prod-eu"), Value::from("web")]),
        );
        Event::new(fields)
    }

    #[test]
    fn equals_compares_numbers_numerically() {
        assert!(cond(r#"equals = { "http.status" = 500 }"#).check(&event()));
        assert!(cond(r#"equals = { "http.status" = 500.0 }"#).check(&event()));
        assert!(!cond(r#"equals = { "http.status" = 404 }"#).check(&event()));
        assert!(!cond(r#"equals = { missing = 1 }"#).check(&event()));
    }

    #[test]
    fn contains_checks_strings_and_arrays() {
        assert!(cond(r#"contains = { message = "disk" }"#).check(&event()));
        assert!(cond(r#"contains = { tags = "eu" }"#).check(&event()));
        assert!(!cond(r#"contains = { message = "DEBUG" }"#).check(&event()));
    }

    #[test]
    fn regexp_matches() {
        assert!(cond(r#"regexp = { message = "^ERROR\\s" }"#).check(&event()));
        assert!(!cond(r#"regexp = { level = "^warn" }"#).check(&event()));
    }

    #[test]
    fn has_fields_and_boolean_combinators() {
        assert!(cond(r#"has_fields = ["level", "http.status"]"#).check(&event()));
        assert!(cond(
            r#"and = [ { equals = { level = "error" } }, { not = { has_fields = ["user"] } } ]"#
        )
        .check(&event()));
        assert!(cond(
            r#"or = [ { equals = { level = "debug" } }, { contains = { message = "disk" } } ]"#
        )
        .check(&event()));
        assert!(!cond(r#"not = { equals = { level = "error" } }"#).check(&event()));
    }

    #[test]
    fn invalid_conditions_are_rejected() {
        let parse = |s: &str| {
            let table: toml::Table = toml::from_str(s).unwrap();
            Condition::from_toml("test", &toml::Value::Table(table))
        };
        assert!(parse("").is_err());
        assert!(parse(r#"bogus = { a = 1 }"#).is_err());
        assert!(parse(r#"regexp = { a = "(" }"#).is_err());
        assert!(parse(r#"and = []"#).is_err());
        assert!(parse(r#"equals = { a = 1 }
contains = { b = "x" }"#)
        .is_err());
    }
}
