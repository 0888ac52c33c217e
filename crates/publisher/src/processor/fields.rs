//! 필드 편집 프로세서 -- add_fields, add_tags, drop_fields

use ironbeat_core::error::{IronbeatError, ProcessorError};
use ironbeat_core::event::{Event, FIELD_METADATA, FIELD_TAGS, Fields, Value};
use ironbeat_core::pipeline::Processor;

use super::settings;

// ─── add_fields ──────────────────────────────────────────────────────

/// 고정 필드를 병합하는 프로세서
///
/// `target`이 비어 있으면 최상위에, `@metadata`이면 메타데이터에 병합합니다.
/// 기본 `target`은 `fields`입니다.
#[derive(Debug, Clone)]
pub struct AddFields {
    target: String,
    fields: Fields,
}

impl AddFields {
    pub const NAME: &'static str = "add_fields";

    pub fn new(target: impl Into<String>, fields: Fields) -> Self {
        Self {
            target: target.into(),
            fields,
        }
    }

    pub fn from_config(config: &toml::Table) -> Result<Self, IronbeatError> {
        let fields = match config.get("fields") {
            Some(toml::Value::Table(t)) if !t.is_empty() => {
                match Value::from_toml(toml::Value::Table(t.clone())) {
                    Value::Object(f) => f,
                    _ => Fields::new(),
                }
            }
            Some(toml::Value::Table(_)) | None => {
                return Err(settings::invalid(Self::NAME, "'fields' is required").into());
            }
            Some(_) => {
                return Err(settings::invalid(Self::NAME, "'fields' must be a table").into());
            }
        };
        let target = settings::optional_str(Self::NAME, config, "target")?.unwrap_or("fields");
        Ok(Self::new(target, fields))
    }
}

impl Processor for AddFields {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run(&self, mut event: Event) -> Result<Option<Event>, ProcessorError> {
        if self.target.is_empty() {
            event.fields.deep_update(&self.fields);
        } else if self.target == FIELD_METADATA {
            event.meta.deep_update(&self.fields);
        } else {
            let mut merged = match event.fields.get(&self.target) {
                Some(Value::Object(existing)) => existing.clone(),
                _ => Fields::new(),
            };
            merged.deep_update(&self.fields);
            event.fields.put(&self.target, merged);
        }
        Ok(Some(event))
    }
}

// ─── add_tags ────────────────────────────────────────────────────────

/// 태그 목록에 값을 추가하는 프로세서 (중복은 건너뜀)
#[derive(Debug, Clone)]
pub struct AddTags {
    target: String,
    tags: Vec<String>,
}

impl AddTags {
    pub const NAME: &'static str = "add_tags";

    pub fn new(target: impl Into<String>, tags: Vec<String>) -> Self {
        Self {
            target: target.into(),
            tags,
        }
    }

    pub fn from_config(config: &toml::Table) -> Result<Self, IronbeatError> {
        let tags = settings::string_list(Self::NAME, config, "tags")?;
        if tags.is_empty() {
            return Err(settings::invalid(Self::NAME, "'tags' must not be empty").into());
        }
        let target = settings::optional_str(Self::NAME, config, "target")?.unwrap_or(FIELD_TAGS);
        if target.is_empty() {
            return Err(settings::invalid(Self::NAME, "'target' must not be empty").into());
        }
        Ok(Self::new(target, tags))
    }
}

impl Processor for AddTags {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run(&self, mut event: Event) -> Result<Option<Event>, ProcessorError> {
        append_tags(&mut event.fields, &self.target, &self.tags).map_err(|reason| {
            ProcessorError::Failed {
                processor: Self::NAME.to_owned(),
                reason,
            }
        })?;
        Ok(Some(event))
    }
}

/// `key` 경로의 태그 배열에 태그를 추가합니다.
///
/// 기존 값이 문자열이면 배열로 승격하고, 그 밖의 타입이면 에러입니다.
pub(crate) fn append_tags(fields: &mut Fields, key: &str, tags: &[String]) -> Result<(), String> {
    let mut current: Vec<Value> = match fields.get(key) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(Value::String(s)) => vec![Value::String(s.clone())],
        Some(_) => return Err(format!("'{key}' is not a list of tags")),
    };
    for tag in tags {
        if !current.iter().any(|v| v.as_str() == Some(tag.as_str())) {
            current.push(Value::String(tag.clone()));
        }
    }
    fields.put(key, current);
    Ok(())
}

// ─── drop_fields ─────────────────────────────────────────────────────

/// 필드를 제거하는 프로세서
///
/// `ignore_missing = false`(기본값)이면 없는 필드를 에러로 보고합니다.
#[derive(Debug, Clone)]
pub struct DropFields {
    fields: Vec<String>,
    ignore_missing: bool,
}

impl DropFields {
    pub const NAME: &'static str = "drop_fields";

    pub fn new(fields: Vec<String>, ignore_missing: bool) -> Self {
        Self {
            fields,
            ignore_missing,
        }
    }

    pub fn from_config(config: &toml::Table) -> Result<Self, IronbeatError> {
        let fields = settings::string_list(Self::NAME, config, "fields")?;
        if fields.is_empty() {
            return Err(settings::invalid(Self::NAME, "'fields' must not be empty").into());
        }
        if let Some(f) = fields.iter().find(|f| f.as_str() == "@timestamp") {
            return Err(settings::invalid(Self::NAME, format!("'{f}' cannot be dropped")).into());
        }
        let ignore_missing =
            settings::optional_bool(Self::NAME, config, "ignore_missing")?.unwrap_or(false);
        Ok(Self::new(fields, ignore_missing))
    }
}

impl Processor for DropFields {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run(&self, mut event: Event) -> Result<Option<Event>, ProcessorError> {
        let mut missing = Vec::new();
        for field in &self.fields {
            if event.delete_value(field).is_none() {
                missing.push(field.as_str());
            }
        }
        if !missing.is_empty() && !self.ignore_missing {
            return Err(ProcessorError::Failed {
                processor: Self::NAME.to_owned(),
                reason: format!("fields not found: {}", missing.join(", ")),
            });
        }
        Ok(Some(event))
    }
}
