//! 이벤트 모델 -- 수집기가 생성하고 출력이 소비하는 기본 단위
//!
//! [`Event`]는 세 부분으로 나뉩니다.
//! - `fields`: 출력으로 전송되는 필드 페이로드
//! - `meta`: 라우팅/출력 주소 지정용 메타데이터 (페이로드에 병합되지 않음)
//! - `private`: 프로듀서 소유의 불투명 값 (파이프라인은 전달만 하고 ACK 시 돌려줌)
//!
//! 필드 경로는 점(`.`)으로 구분된 중첩 키입니다 (예: `agent.name`).

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// 타임스탬프 가상 필드 이름
pub const FIELD_TIMESTAMP: &str = "@timestamp";
/// 메타데이터 가상 필드 접두어
pub const FIELD_METADATA: &str = "@metadata";
/// 포맷된 인덱스(목적지 이름)를 담는 메타데이터 키
pub const META_RAW_INDEX: &str = "raw_index";
/// 태그 필드 이름
pub const FIELD_TAGS: &str = "tags";

/// 타입이 있는 필드 값
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    Array(Vec<Value>),
    Object(Fields),
}

impl Value {
    /// 문자열 값이면 참조를 반환합니다.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// 중첩 매핑이면 참조를 반환합니다.
    pub fn as_object(&self) -> Option<&Fields> {
        match self {
            Self::Object(f) => Some(f),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// 출력용 JSON 값으로 변환합니다. 타임스탬프는 RFC 3339 문자열이 됩니다.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Timestamp(ts) => {
                serde_json::Value::String(ts.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            Self::Array(items) => serde_json::Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Object(fields) => fields.to_json(),
        }
    }

    /// JSON 값을 필드 값으로 변환합니다.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(0.0)),
            },
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::Object(Fields(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            )),
        }
    }

    /// TOML 설정 값을 필드 값으로 변환합니다 (`add_fields` 등 프로세서 설정용).
    pub fn from_toml(value: toml::Value) -> Self {
        match value {
            toml::Value::String(s) => Self::String(s),
            toml::Value::Integer(i) => Self::Int(i),
            toml::Value::Float(f) => Self::Float(f),
            toml::Value::Boolean(b) => Self::Bool(b),
            toml::Value::Datetime(dt) => {
                let text = dt.to_string();
                match DateTime::parse_from_rfc3339(&text) {
                    Ok(parsed) => Self::Timestamp(parsed.with_timezone(&Utc)),
                    Err(_) => Self::String(text),
                }
            }
            toml::Value::Array(items) => {
                Self::Array(items.into_iter().map(Self::from_toml).collect())
            }
            toml::Value::Table(table) => Self::Object(Fields(
                table
                    .into_iter()
                    .map(|(k, v)| (k, Self::from_toml(v)))
                    .collect(),
            )),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Self::Array(_) | Self::Object(_) => write!(f, "{}", self.to_json()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<u64> for Value {
    fn from(i: u64) -> Self {
        Self::Int(i64::try_from(i).unwrap_or(i64::MAX))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(ts: DateTime<Utc>) -> Self {
        Self::Timestamp(ts)
    }
}

impl From<Fields> for Value {
    fn from(fields: Fields) -> Self {
        Self::Object(fields)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Array(items)
    }
}

/// 필드 이름 → 값의 정렬된 매핑
///
/// 점으로 구분된 경로로 중첩 매핑을 조회/수정할 수 있습니다.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fields(BTreeMap<String, Value>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    /// 최상위 키를 직접 설정합니다 (경로 해석 없음).
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// 경로로 값을 조회합니다.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.0.get(first)?;
        for segment in segments {
            current = current.as_object()?.0.get(segment)?;
        }
        Some(current)
    }

    /// 경로에 값을 설정하고 이전 값을 반환합니다.
    ///
    /// 중간 경로가 없거나 매핑이 아니면 빈 매핑으로 대체합니다.
    pub fn put(&mut self, path: &str, value: impl Into<Value>) -> Option<Value> {
        let value = value.into();
        match path.split_once('.') {
            None => self.0.insert(path.to_owned(), value),
            Some((head, rest)) => {
                let child = self
                    .0
                    .entry(head.to_owned())
                    .or_insert_with(|| Value::Object(Fields::new()));
                if !matches!(child, Value::Object(_)) {
                    *child = Value::Object(Fields::new());
                }
                match child {
                    Value::Object(inner) => inner.put(rest, value),
                    _ => None,
                }
            }
        }
    }

    /// 경로의 값을 제거하고 반환합니다.
    pub fn delete(&mut self, path: &str) -> Option<Value> {
        match path.split_once('.') {
            None => self.0.remove(path),
            Some((head, rest)) => match self.0.get_mut(head)? {
                Value::Object(inner) => inner.delete(rest),
                _ => None,
            },
        }
    }

    /// 다른 매핑을 재귀적으로 병합합니다. 충돌 시 `other`가 우선합니다.
    pub fn deep_update(&mut self, other: &Fields) {
        for (key, value) in &other.0 {
            match (self.0.get_mut(key), value) {
                (Some(Value::Object(existing)), Value::Object(incoming)) => {
                    existing.deep_update(incoming);
                }
                _ => {
                    self.0.insert(key.clone(), value.clone());
                }
            }
        }
    }

    /// null 값을 재귀적으로 제거합니다.
    pub fn remove_nulls(&mut self) {
        self.0.retain(|_, value| !value.is_null());
        for value in self.0.values_mut() {
            if let Value::Object(inner) = value {
                inner.remove_nulls();
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Fields {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// 프로듀서 소유의 불투명 값
///
/// 파이프라인은 내용을 검사하지 않고 이벤트와 함께 전달하며,
/// ACK 시 리스너에 그대로 돌려줍니다 (예: 파일 읽기 오프셋).
#[derive(Clone)]
pub struct Private(Arc<dyn Any + Send + Sync>);

impl Private {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// 원래 타입으로 다운캐스트합니다.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for Private {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Private(..)")
    }
}

/// 수집기가 생성하여 출력으로 전달되는 구조화된 레코드
///
/// 프로세서는 이벤트를 값으로 받아 대체 이벤트를 반환합니다.
/// 큐에 들어간 뒤에는 `Arc<Event>`로 공유되며 더 이상 변경되지 않습니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// 이벤트 발생 시각
    pub timestamp: DateTime<Utc>,
    /// 필드 페이로드
    #[serde(default)]
    pub fields: Fields,
    /// 라우팅용 메타데이터
    #[serde(default)]
    pub meta: Fields,
    /// 프로듀서 소유 값 (디스크에 저장되지 않음)
    #[serde(skip)]
    pub private: Option<Private>,
}

impl Event {
    /// 현재 시각으로 새 이벤트를 생성합니다.
    pub fn new(fields: Fields) -> Self {
        Self::with_timestamp(Utc::now(), fields)
    }

    pub fn with_timestamp(timestamp: DateTime<Utc>, fields: Fields) -> Self {
        Self {
            timestamp,
            fields,
            meta: Fields::new(),
            private: None,
        }
    }

    /// 프로듀서 private 값을 설정합니다.
    pub fn with_private<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.private = Some(Private::new(value));
        self
    }

    /// 경로로 값을 조회합니다.
    ///
    /// `@timestamp`는 이벤트 시각을, `@metadata.*`는 메타데이터를 가리킵니다.
    pub fn get_value(&self, path: &str) -> Option<Value> {
        if path == FIELD_TIMESTAMP {
            return Some(Value::Timestamp(self.timestamp));
        }
        if let Some(meta_path) = path.strip_prefix("@metadata.") {
            return self.meta.get(meta_path).cloned();
        }
        self.fields.get(path).cloned()
    }

    /// 경로에 값을 설정합니다. `@metadata.*` 경로는 메타데이터에 기록됩니다.
    pub fn put_value(&mut self, path: &str, value: impl Into<Value>) -> Option<Value> {
        if let Some(meta_path) = path.strip_prefix("@metadata.") {
            return self.meta.put(meta_path, value);
        }
        self.fields.put(path, value)
    }

    /// 경로의 값을 제거합니다.
    pub fn delete_value(&mut self, path: &str) -> Option<Value> {
        if let Some(meta_path) = path.strip_prefix("@metadata.") {
            return self.meta.delete(meta_path);
        }
        self.fields.delete(path)
    }

    /// 출력 형식의 JSON 문서로 변환합니다.
    pub fn to_json(&self) -> serde_json::Value {
        let mut doc = match self.fields.to_json() {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        doc.insert(
            FIELD_TIMESTAMP.to_owned(),
            Value::Timestamp(self.timestamp).to_json(),
        );
        if !self.meta.is_empty() {
            doc.insert(FIELD_METADATA.to_owned(), self.meta.to_json());
        }
        serde_json::Value::Object(doc)
    }
}
