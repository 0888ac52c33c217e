//! 에이전트 정적 정보 -- 포맷 문자열과 이벤트 메타데이터의 고정 필드

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::Fields;

/// 에이전트 타입 이름
pub const AGENT_TYPE: &str = "ironbeat";

/// 프로세스 수명 동안 바뀌지 않는 에이전트 정보
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// 에이전트 이름 (`general.name`)
    pub name: String,
    /// 에이전트 타입
    pub agent_type: String,
    /// 버전
    pub version: String,
    /// 프로세스 시작마다 새로 생성되는 식별자
    pub ephemeral_id: String,
    /// 호스트 이름
    pub hostname: String,
}

impl AgentInfo {
    /// 현재 프로세스의 에이전트 정보를 생성합니다.
    pub fn new(name: impl Into<String>) -> Self {
        let hostname = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_owned());
        Self {
            name: name.into(),
            agent_type: AGENT_TYPE.to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            ephemeral_id: Uuid::new_v4().to_string(),
            hostname,
        }
    }

    /// 포맷 문자열이 참조할 수 있는 정적 필드
    ///
    /// `agent.*`와 하위 호환용 `beat.*` 경로를 모두 제공합니다.
    pub fn static_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.put("agent.name", self.name.as_str());
        fields.put("agent.type", self.agent_type.as_str());
        fields.put("agent.version", self.version.as_str());
        fields.put("agent.ephemeral_id", self.ephemeral_id.as_str());
        fields.put("agent.hostname", self.hostname.as_str());
        fields.put("beat.name", self.name.as_str());
        fields.put("beat.version", self.version.as_str());
        fields
    }
}

impl Default for AgentInfo {
    fn default() -> Self {
        Self::new(AGENT_TYPE)
    }
}
