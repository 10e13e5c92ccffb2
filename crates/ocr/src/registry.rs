//! Engine registration and selection.

use std::cmp::Reverse;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tracing::{debug, warn};

use jobflow_core::{ClassifiedError, ErrorKind};

use crate::engine::Engine;

/// Engine name that asks for the best registered match.
pub const AUTO: &str = "auto";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SelectionCriteria {
    pub language: String,
    /// Only engines that run offline qualify.
    pub offline: bool,
    /// Prefer high-quality engines.
    pub high_quality: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("unknown {kind} engine `{name}`")]
    UnknownEngine { kind: &'static str, name: String },

    #[error("no {kind} engine available for language `{language}` (offline: {offline})")]
    NoSuitableEngine {
        kind: &'static str,
        language: String,
        offline: bool,
    },
}

impl SelectionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SelectionError::UnknownEngine { .. } => ErrorKind::Validation,
            SelectionError::NoSuitableEngine { .. } => ErrorKind::Resource,
        }
    }
}

impl From<SelectionError> for ClassifiedError {
    fn from(err: SelectionError) -> Self {
        ClassifiedError::new(err.kind(), err.to_string())
    }
}

/// Named engines of one kind, in registration order.
pub struct EngineRegistry<E: ?Sized> {
    kind: &'static str,
    engines: RwLock<Vec<Arc<E>>>,
}

impl<E: Engine + ?Sized> std::fmt::Debug for EngineRegistry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("kind", &self.kind)
            .field("engines", &self.names())
            .finish()
    }
}

impl<E: Engine + ?Sized> EngineRegistry<E> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            engines: RwLock::new(Vec::new()),
        }
    }

    /// Add `engine`, replacing a registered engine with the same name in place.
    pub fn register(&self, engine: Arc<E>) {
        let mut engines = self.engines.write().unwrap_or_else(PoisonError::into_inner);
        match engines.iter().position(|e| e.name() == engine.name()) {
            Some(index) => {
                warn!(kind = self.kind, engine = engine.name(), "engine replaced");
                engines[index] = engine;
            }
            None => {
                debug!(kind = self.kind, engine = engine.name(), "engine registered");
                engines.push(engine);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<E>> {
        self.engines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|e| e.name() == name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.engines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.engines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Resolve `choice`: an engine name, or [`AUTO`] for the best match.
    ///
    /// `auto` keeps engines that support the language (and run offline when
    /// required), then prefers high quality when asked, explicit language
    /// support, offline engines, and finally registration order.
    pub fn select(&self, choice: &str, criteria: &SelectionCriteria) -> Result<Arc<E>, SelectionError> {
        if !choice.eq_ignore_ascii_case(AUTO) {
            return self.get(choice).ok_or_else(|| SelectionError::UnknownEngine {
                kind: self.kind,
                name: choice.to_string(),
            });
        }

        let engines = self.engines.read().unwrap_or_else(PoisonError::into_inner);
        engines
            .iter()
            .enumerate()
            .filter_map(|(index, engine)| {
                let caps = engine.capabilities();
                let eligible = caps.supports(&criteria.language) && (!criteria.offline || caps.offline);
                eligible.then(|| {
                    let explicit = caps
                        .languages
                        .iter()
                        .any(|l| l.eq_ignore_ascii_case(&criteria.language));
                    let score = (criteria.high_quality && caps.high_quality, explicit, caps.offline);
                    (Reverse(score), index, engine)
                })
            })
            .min_by_key(|(score, index, _)| (*score, *index))
            .map(|(_, _, engine)| Arc::clone(engine))
            .ok_or_else(|| SelectionError::NoSuitableEngine {
                kind: self.kind,
                language: criteria.language.clone(),
                offline: criteria.offline,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineCapabilities;

    struct Named {
        name: &'static str,
        caps: EngineCapabilities,
    }

    impl Engine for Named {
        fn name(&self) -> &str {
            self.name
        }

        fn capabilities(&self) -> EngineCapabilities {
            self.caps.clone()
        }
    }

    fn engine(name: &'static str, offline: bool, high_quality: bool, langs: &[&str]) -> Arc<dyn Engine> {
        Arc::new(Named {
            name,
            caps: EngineCapabilities {
                offline,
                high_quality,
                languages: langs.iter().map(|l| l.to_string()).collect(),
            },
        })
    }

    fn registry() -> EngineRegistry<dyn Engine> {
        let registry = EngineRegistry::new("ocr");
        registry.register(engine("cloud", false, true, &["en", "ja", "ko"]));
        registry.register(engine("local", true, false, &["en", "ja"]));
        registry.register(engine("generic", true, false, &[]));
        registry
    }

    fn criteria(language: &str, offline: bool, high_quality: bool) -> SelectionCriteria {
        SelectionCriteria {
            language: language.into(),
            offline,
            high_quality,
        }
    }

    #[test]
    fn explicit_name_wins_or_fails_as_validation() {
        let registry = registry();
        let chosen = registry.select("cloud", &criteria("xx", true, false)).unwrap();
        assert_eq!(chosen.name(), "cloud");

        let err = registry.select("nope", &criteria("en", false, false)).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn auto_prefers_quality_when_asked() {
        let registry = registry();
        assert_eq!(registry.select(AUTO, &criteria("ja", false, true)).unwrap().name(), "cloud");
        assert_eq!(registry.select(AUTO, &criteria("ja", false, false)).unwrap().name(), "local");
    }

    #[test]
    fn auto_respects_offline_and_language() {
        let registry = registry();
        assert_eq!(registry.select(AUTO, &criteria("ko", true, true)).unwrap().name(), "generic");
        assert_eq!(registry.select(AUTO, &criteria("ko", false, false)).unwrap().name(), "cloud");
    }

    #[test]
    fn auto_with_nothing_registered_is_a_resource_error() {
        let registry: EngineRegistry<dyn Engine> = EngineRegistry::new("translation");
        let err = registry.select(AUTO, &criteria("en", false, false)).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Resource);
        let classified: ClassifiedError = err.into();
        assert!(classified.message.contains("translation"));
    }

    #[test]
    fn re_registering_replaces_in_place() {
        let registry = registry();
        registry.register(engine("local", true, true, &["en"]));
        assert_eq!(registry.names(), vec!["cloud", "local", "generic"]);
        assert!(registry.get("local").unwrap().capabilities().high_quality);
    }
}
