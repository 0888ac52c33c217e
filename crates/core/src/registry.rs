//! 생성자 레지스트리 -- 타입 이름으로 프로세서/출력을 생성
//!
//! 설정 파일의 `type = "..."` 이름을 생성자 함수에 매핑합니다.
//! 내장 생성자는 최초 사용 시 한 번 등록되고, 이후에는 주로 읽기만 합니다.
//!
//! # 사용 예시
//! ```ignore
//! let registry: ConstructorRegistry<Box<dyn Processor>> = ConstructorRegistry::new("processor");
//! registry.register("add_tags", |cfg| Ok(Box::new(AddTags::from_config(cfg)?) as _))?;
//!
//! let processor = registry.build("add_tags", &table)?;
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{IronbeatError, RegistryError};

/// 설정 테이블로부터 값을 생성하는 함수
pub type Constructor<T> = Arc<dyn Fn(&toml::Table) -> Result<T, IronbeatError> + Send + Sync>;

/// 이름 → 생성자 레지스트리
///
/// 같은 이름은 한 번만 등록할 수 있습니다.
pub struct ConstructorRegistry<T> {
    kind: &'static str,
    constructors: RwLock<BTreeMap<String, Constructor<T>>>,
}

impl<T> ConstructorRegistry<T> {
    /// 빈 레지스트리를 생성합니다. `kind`는 에러 메시지에 쓰입니다 (예: `"processor"`).
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            constructors: RwLock::new(BTreeMap::new()),
        }
    }

    /// 레지스트리 종류 이름
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// 생성자를 등록합니다.
    ///
    /// 빈 이름이거나 이미 등록된 이름이면 에러를 반환합니다.
    pub fn register<F>(&self, name: &str, constructor: F) -> Result<(), RegistryError>
    where
        F: Fn(&toml::Table) -> Result<T, IronbeatError> + Send + Sync + 'static,
    {
        if name.is_empty() {
            return Err(RegistryError::EmptyName {
                kind: self.kind.to_owned(),
            });
        }

        let mut constructors = self
            .constructors
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if constructors.contains_key(name) {
            return Err(RegistryError::AlreadyRegistered {
                kind: self.kind.to_owned(),
                name: name.to_owned(),
            });
        }
        constructors.insert(name.to_owned(), Arc::new(constructor));
        tracing::debug!(kind = self.kind, name, "constructor registered");
        Ok(())
    }

    /// 이름으로 생성자를 찾아 값을 생성합니다.
    ///
    /// 생성자는 락 밖에서 호출되므로 생성 중에 레지스트리를 다시 조회해도 됩니다.
    pub fn build(&self, name: &str, config: &toml::Table) -> Result<T, IronbeatError> {
        let constructor = self
            .constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                kind: self.kind.to_owned(),
                name: name.to_owned(),
            })?;
        constructor(config)
    }

    /// 이름이 등록되어 있는지 확인합니다.
    pub fn contains(&self, name: &str) -> bool {
        self.constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// 등록된 이름 목록 (정렬됨)
    pub fn names(&self) -> Vec<String> {
        self.constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}
