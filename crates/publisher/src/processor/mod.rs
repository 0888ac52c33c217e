//! 프로세서 체인 -- 적재 전 이벤트 변환/필터링
//!
//! 클라이언트마다 하나의 [`ProcessorChain`]이 있으며, 포맷 인덱스 프로세서가
//! 항상 사용자 프로세서보다 먼저 실행됩니다. 사용자 프로세서는 타입 이름과
//! 설정 테이블로 [`registry`]에서 생성합니다.
//!
//! # 내장 프로세서
//! - `add_formatted_index`: `@metadata.raw_index` 설정
//! - `add_fields` / `add_tags` / `drop_fields`: 필드 편집
//! - `drop_event`: `when` 조건에 맞는 이벤트 필터링

pub mod condition;
pub mod drop_event;
pub mod fields;
pub mod fmtstr;
pub mod index;
mod settings;

use std::sync::OnceLock;

use ironbeat_core::config::ProcessorConfig;
use ironbeat_core::error::{IronbeatError, ProcessorError};
use ironbeat_core::event::Event;
use ironbeat_core::metrics as m;
use ironbeat_core::pipeline::Processor;
use ironbeat_core::registry::ConstructorRegistry;

use crate::config::ErrorPolicy;
use crate::error::PublisherError;

pub use condition::Condition;
pub use drop_event::DropEvent;
pub use fields::{AddFields, AddTags, DropFields};
pub use fmtstr::{EventFormatString, FormatError, TimestampFormatString};
pub use index::FormattedIndex;

/// 체인에 담기는 프로세서 trait 객체
pub type BoxProcessor = Box<dyn Processor>;

type BuiltinConstructor = fn(&toml::Table) -> Result<BoxProcessor, IronbeatError>;

static REGISTRY: OnceLock<ConstructorRegistry<BoxProcessor>> = OnceLock::new();

/// 프로세서 생성자 레지스트리 (첫 사용 시 내장 프로세서 등록)
pub fn registry() -> &'static ConstructorRegistry<BoxProcessor> {
    REGISTRY.get_or_init(|| {
        let registry = ConstructorRegistry::new("processor");
        let builtins: [(&str, BuiltinConstructor); 5] = [
            (index::NAME, |c| Ok(Box::new(FormattedIndex::from_config(c)?))),
            (AddFields::NAME, |c| Ok(Box::new(AddFields::from_config(c)?))),
            (AddTags::NAME, |c| Ok(Box::new(AddTags::from_config(c)?))),
            (DropFields::NAME, |c| Ok(Box::new(DropFields::from_config(c)?))),
            (DropEvent::NAME, |c| Ok(Box::new(DropEvent::from_config(c)?))),
        ];
        for (name, constructor) in builtins {
            if let Err(e) = registry.register(name, constructor) {
                tracing::error!(processor = name, error = %e, "failed to register builtin processor");
            }
        }
        registry
    })
}

/// 설정 목록으로 사용자 프로세서를 생성합니다.
///
/// 알 수 없는 타입이나 잘못된 설정은 즉시 에러입니다.
pub fn build_processors(configs: &[ProcessorConfig]) -> Result<Vec<BoxProcessor>, PublisherError> {
    configs
        .iter()
        .map(|c| Ok(registry().build(&c.processor_type, &c.settings)?))
        .collect()
}

/// 체인 적용 결과
#[derive(Debug)]
pub enum ChainOutcome {
    /// 모든 프로세서를 통과한 이벤트
    Publish(Event),
    /// 프로세서가 이벤트를 걸러냄
    Filtered,
    /// `drop` 정책으로 버려진 실패 이벤트
    Dropped,
}

/// 순서가 있는 프로세서 목록과 에러 정책
pub struct ProcessorChain {
    processors: Vec<BoxProcessor>,
    policy: ErrorPolicy,
}

impl ProcessorChain {
    /// 빈 체인을 생성합니다.
    pub fn new(policy: ErrorPolicy) -> Self {
        Self {
            processors: Vec::new(),
            policy,
        }
    }

    /// 인덱스 프로세서를 맨 앞에 두고 체인을 구성합니다.
    pub fn with_index(
        index: Option<FormattedIndex>,
        user: Vec<BoxProcessor>,
        policy: ErrorPolicy,
    ) -> Self {
        let mut chain = Self::new(policy);
        if let Some(index) = index {
            chain.push(Box::new(index));
        }
        chain.processors.extend(user);
        chain
    }

    /// 체인 끝에 프로세서를 추가합니다.
    pub fn push(&mut self, processor: BoxProcessor) {
        self.processors.push(processor);
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// 실행 순서대로 프로세서 이름을 반환합니다.
    pub fn names(&self) -> Vec<&str> {
        self.processors.iter().map(|p| p.name()).collect()
    }

    /// 이벤트에 체인을 적용합니다.
    ///
    /// `fail` 정책에서만 에러를 반환합니다. `drop` 정책의 실패는
    /// [`ChainOutcome::Dropped`]로 보고되고 로그/메트릭에 기록됩니다.
    pub fn apply(&self, mut event: Event) -> Result<ChainOutcome, ProcessorError> {
        for processor in &self.processors {
            match processor.run(event) {
                Ok(Some(next)) => event = next,
                Ok(None) => {
                    metrics::counter!(m::PUBLISHER_EVENTS_FILTERED_TOTAL, m::LABEL_PROCESSOR => processor.name().to_owned())
                        .increment(1);
                    return Ok(ChainOutcome::Filtered);
                }
                Err(e) => {
                    metrics::counter!(m::PUBLISHER_PROCESSOR_ERRORS_TOTAL, m::LABEL_PROCESSOR => processor.name().to_owned())
                        .increment(1);
                    return match self.policy {
                        ErrorPolicy::Drop => {
                            tracing::warn!(
                                processor = processor.name(),
                                error = %e,
                                "dropping event after processing failure"
                            );
                            metrics::counter!(m::PUBLISHER_EVENTS_DROPPED_TOTAL, m::LABEL_REASON => "processor_error")
                                .increment(1);
                            Ok(ChainOutcome::Dropped)
                        }
                        ErrorPolicy::Fail => Err(e),
                    };
                }
            }
        }
        Ok(ChainOutcome::Publish(event))
    }
}

impl std::fmt::Debug for ProcessorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorChain")
            .field("processors", &self.names())
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironbeat_core::event::{Fields, META_RAW_INDEX, Value};

    struct Fails;

    impl Processor for Fails {
        fn name(&self) -> &str {
            "fails"
        }

        fn run(&self, _event: Event) -> Result<Option<Event>, ProcessorError> {
            Err(ProcessorError::Failed {
                processor: "fails".to_owned(),
                reason: "boom".to_owned(),
            })
        }
    }

    /// raw_index를 읽어 다른 필드로 복사
    struct CopyIndex;

    impl Processor for CopyIndex {
        fn name(&self) -> &str {
            "copy_index"
        }

        fn run(&self, mut event: Event) -> Result<Option<Event>, ProcessorError> {
            if let Some(index) = event.meta.get(META_RAW_INDEX).cloned() {
                event.fields.put("seen_index", index);
            }
            Ok(Some(event))
        }
    }

    fn event() -> Event {
        let mut fields = Fields::new();
        fields.put("message", "m");
        Event::new(fields)
    }

    fn config(toml_str: &str) -> Vec<ProcessorConfig> {
        #[derive(serde::Deserialize)]
        struct Wrapper {
            processors: Vec<ProcessorConfig>,
        }
        toml::from_str::<Wrapper>(toml_str).unwrap().processors
    }

    #[test]
    fn registry_contains_builtins() {
        let names = registry().names();
        for expected in [
            "add_formatted_index",
            "add_fields",
            "add_tags",
            "drop_fields",
            "drop_event",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }

    #[test]
    fn build_processors_preserves_order() {
        let processors = build_processors(&config(
            r#"
[[processors]]
type = "add_tags"
tags = ["a"]

[[processors]]
type = "drop_fields"
fields = ["message"]
"#,
        ))
        .unwrap();
        let names: Vec<&str> = processors.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["add_tags", "drop_fields"]);
    }

    #[test]
    fn unknown_processor_is_config_error() {
        let Err(err) = build_processors(&config(
            r#"
[[processors]]
type = "does_not_exist"
"#,
        )) else {
            panic!("unknown processor type should fail");
        };
        assert!(err.to_string().contains("does_not_exist"));
    }

    #[test]
    fn index_runs_before_user_processors() {
        let index = FormattedIndex::event_mode("idx-%{+yyyy}").unwrap();
        let chain = ProcessorChain::with_index(Some(index), vec![Box::new(CopyIndex)], ErrorPolicy::Drop);
        assert_eq!(chain.names(), vec!["add_formatted_index", "copy_index"]);

        let ChainOutcome::Publish(out) = chain.apply(event()).unwrap() else {
            panic!("event should be published");
        };
        let seen = out.fields.get("seen_index").and_then(Value::as_str).unwrap();
        assert!(seen.starts_with("idx-"));
    }

    #[test]
    fn drop_policy_swallows_errors() {
        let chain = ProcessorChain::with_index(None, vec![Box::new(Fails)], ErrorPolicy::Drop);
        assert!(matches!(chain.apply(event()).unwrap(), ChainOutcome::Dropped));
    }

    #[test]
    fn fail_policy_returns_error() {
        let chain = ProcessorChain::with_index(None, vec![Box::new(Fails)], ErrorPolicy::Fail);
        assert!(chain.apply(event()).is_err());
    }

    #[test]
    fn filtered_stops_chain() {
        let chain = ProcessorChain::with_index(
            None,
            vec![Box::new(DropEvent::new(None)), Box::new(Fails)],
            ErrorPolicy::Fail,
        );
        // 필터링 이후 프로세서는 실행되지 않아야 함
        assert!(matches!(chain.apply(event()).unwrap(), ChainOutcome::Filtered));
    }

    #[test]
    fn empty_chain_passes_through() {
        let chain = ProcessorChain::new(ErrorPolicy::Drop);
        assert!(chain.is_empty());
        assert!(matches!(chain.apply(event()).unwrap(), ChainOutcome::Publish(_)));
    }
}
