//! 포맷 문자열 -- 이벤트 필드와 타임스탬프로 문자열 생성
//!
//! # 문법
//! - `%{[field.path]}`: 이벤트 필드 값 (없으면 에러)
//! - `%{[field.path]:default}`: 필드가 없으면 `default`
//! - `%{+yyyy.MM.dd}`: 이벤트 타임스탬프를 Joda 스타일 패턴으로 포맷 (UTC)
//! - 그 밖의 텍스트는 그대로 출력
//!
//! [`EventFormatString`]은 이벤트 전체에 대해 평가되고,
//! [`TimestampFormatString`]은 생성 시점에 필드 참조를 정적 필드로 해석해
//! 실행 시에는 타임스탬프만 필요합니다.

use std::fmt;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Utc};
use ironbeat_core::event::{Event, Fields, Value};

/// 포맷 문자열 에러
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    /// 문법 오류
    #[error("invalid format string at {pos}: {reason}")]
    Syntax {
        /// 문자 위치
        pos: usize,
        /// 사유
        reason: String,
    },

    /// 참조한 필드가 없음
    #[error("field '{0}' is missing")]
    MissingField(String),

    /// 문자열로 만들 수 없는 필드 값 (매핑, 배열, null)
    #[error("field '{0}' is not a primitive value")]
    NotPrimitive(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Field {
        path: String,
        default: Option<String>,
    },
    /// chrono strftime 형식으로 변환된 타임스탬프 패턴
    Timestamp(String),
}

/// 이벤트 전체를 참조하는 포맷 문자열
#[derive(Debug, Clone, PartialEq)]
pub struct EventFormatString {
    source: String,
    segments: Vec<Segment>,
}

impl EventFormatString {
    /// 포맷 문자열을 파싱합니다.
    pub fn parse(source: &str) -> Result<Self, FormatError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = source;
        let mut pos = 0_usize;

        while let Some(start) = rest.find("%{") {
            literal.push_str(&rest[..start]);
            let expr_start = start + 2;
            let Some(len) = rest[expr_start..].find('}') else {
                return Err(FormatError::Syntax {
                    pos: pos + start,
                    reason: "unterminated expression".to_owned(),
                });
            };
            let expr = &rest[expr_start..expr_start + len];

            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(parse_expression(expr, pos + start)?);

            let consumed = expr_start + len + 1;
            pos += consumed;
            rest = &rest[consumed..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_owned(),
            segments,
        })
    }

    /// 원본 포맷 문자열
    pub fn source(&self) -> &str {
        &self.source
    }

    /// 필드나 타임스탬프 참조가 없는 상수 문자열인지 확인합니다.
    pub fn is_const(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    /// 참조하는 필드 경로 목록
    pub fn fields(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Field { path, .. } => Some(path.as_str()),
                _ => None,
            })
            .collect()
    }

    /// 이벤트에 대해 평가합니다.
    pub fn run(&self, event: &Event) -> Result<String, FormatError> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field { path, default } => {
                    push_field(&mut out, path, event.get_value(path), default.as_deref())?;
                }
                Segment::Timestamp(format) => {
                    out.push_str(&event.timestamp.format(format).to_string());
                }
            }
        }
        Ok(out)
    }
}

impl fmt::Display for EventFormatString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TimestampSegment {
    Literal(String),
    Timestamp(String),
}

/// 타임스탬프만으로 평가되는 포맷 문자열
///
/// 필드 참조는 생성 시점에 정적 필드(`agent.*`, `beat.*`)로 해석됩니다.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampFormatString {
    source: String,
    segments: Vec<TimestampSegment>,
}

impl TimestampFormatString {
    /// 정적 필드로 필드 참조를 해석하여 생성합니다.
    pub fn new(format: &EventFormatString, static_fields: &Fields) -> Result<Self, FormatError> {
        let mut segments: Vec<TimestampSegment> = Vec::new();
        for segment in &format.segments {
            match segment {
                Segment::Literal(text) => push_literal(&mut segments, text),
                Segment::Field { path, default } => {
                    let mut resolved = String::new();
                    push_field(
                        &mut resolved,
                        path,
                        static_fields.get(path).cloned(),
                        default.as_deref(),
                    )?;
                    push_literal(&mut segments, &resolved);
                }
                Segment::Timestamp(f) => segments.push(TimestampSegment::Timestamp(f.clone())),
            }
        }
        Ok(Self {
            source: format.source.clone(),
            segments,
        })
    }

    /// 문자열을 파싱하고 정적 필드로 해석합니다.
    pub fn parse(source: &str, static_fields: &Fields) -> Result<Self, FormatError> {
        Self::new(&EventFormatString::parse(source)?, static_fields)
    }

    /// 타임스탬프로 평가합니다.
    pub fn run(&self, timestamp: DateTime<Utc>) -> String {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                TimestampSegment::Literal(text) => out.push_str(text),
                TimestampSegment::Timestamp(format) => {
                    out.push_str(&timestamp.format(format).to_string());
                }
            }
        }
        out
    }
}

impl fmt::Display for TimestampFormatString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn push_literal(segments: &mut Vec<TimestampSegment>, text: &str) {
    if let Some(TimestampSegment::Literal(last)) = segments.last_mut() {
        last.push_str(text);
    } else {
        segments.push(TimestampSegment::Literal(text.to_owned()));
    }
}

fn push_field(
    out: &mut String,
    path: &str,
    value: Option<Value>,
    default: Option<&str>,
) -> Result<(), FormatError> {
    match value {
        Some(Value::Object(_) | Value::Array(_)) => Err(FormatError::NotPrimitive(path.to_owned())),
        Some(Value::Null) | None => match default {
            Some(d) => {
                out.push_str(d);
                Ok(())
            }
            None => Err(FormatError::MissingField(path.to_owned())),
        },
        Some(v) => {
            out.push_str(&v.to_string());
            Ok(())
        }
    }
}

fn parse_expression(expr: &str, pos: usize) -> Result<Segment, FormatError> {
    if let Some(pattern) = expr.strip_prefix('+') {
        return Ok(Segment::Timestamp(joda_to_strftime(pattern, pos)?));
    }

    let Some(inner) = expr.strip_prefix('[') else {
        return Err(FormatError::Syntax {
            pos,
            reason: format!("expected '[field]' or '+pattern', got '{expr}'"),
        });
    };
    let Some(close) = inner.find(']') else {
        return Err(FormatError::Syntax {
            pos,
            reason: "missing ']' in field reference".to_owned(),
        });
    };
    let path = inner[..close].trim();
    if path.is_empty() {
        return Err(FormatError::Syntax {
            pos,
            reason: "empty field reference".to_owned(),
        });
    }

    let tail = &inner[close + 1..];
    let default = if tail.is_empty() {
        None
    } else if let Some(d) = tail.strip_prefix(':') {
        Some(d.to_owned())
    } else {
        return Err(FormatError::Syntax {
            pos,
            reason: format!("unexpected '{tail}' after field reference"),
        });
    };

    Ok(Segment::Field {
        path: path.to_owned(),
        default,
    })
}

/// Joda 스타일 날짜 패턴을 chrono strftime 형식으로 변환합니다.
fn joda_to_strftime(pattern: &str, pos: usize) -> Result<String, FormatError> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '\'' {
            // '' → 작은따옴표, 'text' → 리터럴
            if chars.get(i + 1) == Some(&'\'') {
                out.push('\'');
                i += 2;
                continue;
            }
            let Some(end) = chars[i + 1..].iter().position(|ch| *ch == '\'') else {
                return Err(FormatError::Syntax {
                    pos,
                    reason: "unterminated quote in timestamp pattern".to_owned(),
                });
            };
            for ch in &chars[i + 1..i + 1 + end] {
                push_escaped(&mut out, *ch);
            }
            i += end + 2;
            continue;
        }

        if !c.is_ascii_alphabetic() {
            push_escaped(&mut out, c);
            i += 1;
            continue;
        }

        let run = chars[i..].iter().take_while(|ch| **ch == c).count();
        let spec = match (c, run) {
            ('y' | 'Y', 2) => "%y",
            ('y' | 'Y', _) => "%Y",
            ('x', _) => "%G",
            ('w', 1) => "%-V",
            ('w', _) => "%V",
            ('M', 1) => "%-m",
            ('M', 2) => "%m",
            ('M', 3) => "%b",
            ('M', _) => "%B",
            ('d', 1) => "%-d",
            ('d', _) => "%d",
            ('D', _) => "%j",
            ('E', 1..=3) => "%a",
            ('E', _) => "%A",
            ('e', _) => "%u",
            ('H', 1) => "%-H",
            ('H', _) => "%H",
            ('h', 1) => "%-I",
            ('h', _) => "%I",
            ('m', 1) => "%-M",
            ('m', _) => "%M",
            ('s', 1) => "%-S",
            ('s', _) => "%S",
            ('S', 1..=3) => "%3f",
            ('S', 4..=6) => "%6f",
            ('S', _) => "%9f",
            ('a', _) => "%p",
            ('Z', 1) => "%z",
            ('Z', _) => "%:z",
            _ => {
                return Err(FormatError::Syntax {
                    pos,
                    reason: format!("unsupported timestamp pattern letter '{c}'"),
                });
            }
        };
        out.push_str(spec);
        i += run;
    }

    if StrftimeItems::new(&out).any(|item| matches!(item, Item::Error)) {
        return Err(FormatError::Syntax {
            pos,
            reason: format!("invalid timestamp pattern '{pattern}'"),
        });
    }
    Ok(out)
}

fn push_escaped(out: &mut String, c: char) {
    if c == '%' {
        out.push_str("%%");
    } else {
        out.push(c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_event() -> Event {
        let ts = Utc.with_ymd_and_hms(2024, 1, 5, 7, 8, 9).unwrap();
        let mut fields = Fields::new();
        fields.put("service.name", "billing");
        fields.put("event.code", 4624_i64);
        fields.put("nested.obj.a", 1_i64);
        Event::with_timestamp(ts, fields)
    }

    #[test]
    fn literal_only_is_const() {
        let f = EventFormatString::parse("logs-static").unwrap();
        assert!(f.is_const());
        assert_eq!(f.run(&sample_event()).unwrap(), "logs-static");
    }

    #[test]
    fn field_and_timestamp_references() {
        let f = EventFormatString::parse("%{[service.name]}-%{+yyyy.MM.dd}").unwrap();
        assert!(!f.is_const());
        assert_eq!(f.fields(), vec!["service.name"]);
        assert_eq!(f.run(&sample_event()).unwrap(), "billing-2024.01.05");
    }

    #[test]
    fn numeric_field_renders_as_text() {
        let f = EventFormatString::parse("code-%{[event.code]}").unwrap();
        assert_eq!(f.run(&sample_event()).unwrap(), "code-4624");
    }

    #[test]
    fn missing_field_uses_default_or_fails() {
        let with_default = EventFormatString::parse("%{[missing.field]:fallback}").unwrap();
        assert_eq!(with_default.run(&sample_event()).unwrap(), "fallback");

        let without = EventFormatString::parse("%{[missing.field]}").unwrap();
        assert_eq!(
            without.run(&sample_event()).unwrap_err(),
            FormatError::MissingField("missing.field".to_owned())
        );
    }

    #[test]
    fn empty_default_is_allowed() {
        let f = EventFormatString::parse("x%{[missing]:}y").unwrap();
        assert_eq!(f.run(&sample_event()).unwrap(), "xy");
    }

    #[test]
    fn object_field_is_rejected() {
        let f = EventFormatString::parse("%{[nested.obj]}").unwrap();
        assert!(matches!(
            f.run(&sample_event()),
            Err(FormatError::NotPrimitive(_))
        ));
    }

    #[test]
    fn syntax_errors() {
        assert!(EventFormatString::parse("%{[unterminated").is_err());
        assert!(EventFormatString::parse("%{noBrackets}").is_err());
        assert!(EventFormatString::parse("%{[]}").is_err());
        assert!(EventFormatString::parse("%{[a]junk}").is_err());
        assert!(EventFormatString::parse("%{+yyyy.QQ}").is_err());
    }

    #[test]
    fn joda_patterns_translate() {
        let event = sample_event();
        let cases = [
            ("%{+yyyy-MM-dd'T'HH:mm:ss}", "2024-01-05T07:08:09"),
            ("%{+yy.M.d}", "24.1.5"),
            ("%{+MMM}", "Jan"),
            ("%{+HH'h'}", "07h"),
            ("%{+''yyyy''}", "'2024'"),
            ("%{+DDD}", "005"),
        ];
        for (pattern, expected) in cases {
            let f = EventFormatString::parse(pattern).unwrap();
            assert_eq!(f.run(&event).unwrap(), expected, "pattern {pattern}");
        }
    }

    #[test]
    fn percent_in_literal_pattern_is_escaped() {
        let f = EventFormatString::parse("%{+'100%'yyyy}").unwrap();
        assert_eq!(f.run(&sample_event()).unwrap(), "100%2024");
    }

    #[test]
    fn timestamp_format_resolves_static_fields() {
        let mut statics = Fields::new();
        statics.put("agent.name", "shipper");
        statics.put("agent.version", "0.1.0");

        let f = TimestampFormatString::parse(
            "%{[agent.name]}-%{[agent.version]}-%{+yyyy.MM.dd}",
            &statics,
        )
        .unwrap();
        let ts = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap();
        assert_eq!(f.run(ts), "shipper-0.1.0-2023.12.31");
    }

    #[test]
    fn timestamp_format_rejects_unknown_static_field() {
        let statics = Fields::new();
        let err = TimestampFormatString::parse("%{[host.name]}-%{+yyyy}", &statics).unwrap_err();
        assert_eq!(err, FormatError::MissingField("host.name".to_owned()));
    }
}
