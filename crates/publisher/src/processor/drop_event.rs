//! drop_event 프로세서 -- 조건에 맞는 이벤트를 필터링

use ironbeat_core::error::{IronbeatError, ProcessorError};
use ironbeat_core::event::Event;
use ironbeat_core::pipeline::Processor;

use super::condition::Condition;

/// 조건에 맞는 이벤트를 버리는 프로세서
///
/// `when`이 없으면 모든 이벤트를 버립니다.
#[derive(Debug, Clone)]
pub struct DropEvent {
    when: Option<Condition>,
}

impl DropEvent {
    pub const NAME: &'static str = "drop_event";

    pub fn new(when: Option<Condition>) -> Self {
        Self { when }
    }

    pub fn from_config(config: &toml::Table) -> Result<Self, IronbeatError> {
        let when = config
            .get("when")
            .map(|v| Condition::from_toml(Self::NAME, v))
            .transpose()?;
        Ok(Self::new(when))
    }
}

impl Processor for DropEvent {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run(&self, event: Event) -> Result<Option<Event>, ProcessorError> {
        match &self.when {
            Some(condition) if !condition.check(&event) => Ok(Some(event)),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironbeat_core::event::Fields;

    fn event(message: &str) -> Event {
        let mut fields = Fields::new();
        fields.put("message", message);
        Event::new(fields)
    }

    #[test]
    fn drops_only_matching_events() {
        let table: toml::Table =
            toml::from_str(r#"when = { contains = { message = "DEBUG" } }"#).unwrap();
        let p = DropEvent::from_config(&table).unwrap();

        assert!(p.run(event("DEBUG noisy")).unwrap().is_none());
        assert!(p.run(event("INFO useful")).unwrap().is_some());
    }

    #[test]
    fn without_condition_drops_everything() {
        let p = DropEvent::from_config(&toml::Table::new()).unwrap();
        assert!(p.run(event("anything")).unwrap().is_none());
    }

    #[test]
    fn invalid_condition_fails_construction() {
        let table: toml::Table = toml::from_str(r#"when = { nope = 1 }"#).unwrap();
        assert!(DropEvent::from_config(&table).is_err());
    }
}
