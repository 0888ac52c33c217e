//! 프로세서 설정 테이블 읽기 헬퍼

use ironbeat_core::error::ProcessorError;

pub(crate) fn invalid(processor: &str, reason: impl Into<String>) -> ProcessorError {
    ProcessorError::InvalidConfig {
        processor: processor.to_owned(),
        reason: reason.into(),
    }
}

pub(crate) fn required_str<'a>(
    processor: &str,
    config: &'a toml::Table,
    key: &str,
) -> Result<&'a str, ProcessorError> {
    match config.get(key) {
        Some(toml::Value::String(s)) if !s.is_empty() => Ok(s),
        Some(toml::Value::String(_)) | None => {
            Err(invalid(processor, format!("'{key}' is required")))
        }
        Some(_) => Err(invalid(processor, format!("'{key}' must be a string"))),
    }
}

pub(crate) fn optional_str<'a>(
    processor: &str,
    config: &'a toml::Table,
    key: &str,
) -> Result<Option<&'a str>, ProcessorError> {
    match config.get(key) {
        None => Ok(None),
        Some(toml::Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(invalid(processor, format!("'{key}' must be a string"))),
    }
}

pub(crate) fn optional_bool(
    processor: &str,
    config: &toml::Table,
    key: &str,
) -> Result<Option<bool>, ProcessorError> {
    match config.get(key) {
        None => Ok(None),
        Some(toml::Value::Boolean(b)) => Ok(Some(*b)),
        Some(_) => Err(invalid(processor, format!("'{key}' must be a boolean"))),
    }
}

/// 문자열 하나 또는 문자열 배열을 읽습니다.
pub(crate) fn string_list(
    processor: &str,
    config: &toml::Table,
    key: &str,
) -> Result<Vec<String>, ProcessorError> {
    match config.get(key) {
        None => Ok(Vec::new()),
        Some(toml::Value::String(s)) => Ok(vec![s.clone()]),
        Some(toml::Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                toml::Value::String(s) => Ok(s.clone()),
                _ => Err(invalid(processor, format!("'{key}' must contain only strings"))),
            })
            .collect(),
        Some(_) => Err(invalid(
            processor,
            format!("'{key}' must be a string or an array of strings"),
        )),
    }
}
