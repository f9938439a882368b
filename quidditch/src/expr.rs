//! User-defined expression modules. The engine treats an expression as an
//! opaque predicate over a document's stored fields; each registered
//! module keeps a small pool of evaluator instances. Acquisition is
//! non-blocking with a bounded number of attempts, and the module's shared
//! register state lives behind its own mutex, distinct from the pool lock.

use crate::error::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

type JsonMap = serde_json::Map<String, serde_json::Value>;

/// One pooled evaluator instance.
pub trait ExpressionEvaluator: Send {
    /// Test a document's stored fields against a serialized predicate.
    fn matches(&mut self, payload: &[u8], source: &JsonMap) -> Result<bool>;
}

/// Factory for evaluator instances of one module.
pub trait ExpressionModule: Send + Sync {
    fn instantiate(&self) -> Result<Box<dyn ExpressionEvaluator>>;
}

const ACQUIRE_ATTEMPTS: u32 = 50;
const ACQUIRE_BACKOFF: Duration = Duration::from_millis(1);

struct ModulePool {
    module: Arc<dyn ExpressionModule>,
    idle: Mutex<Vec<Box<dyn ExpressionEvaluator>>>,
    /// Instances handed out or idle; bounded by `capacity`.
    outstanding: Mutex<usize>,
    capacity: usize,
    /// Shared register state for the module's evaluators. Guarded
    /// separately so holding a register has no effect on pool acquisition.
    registers: Mutex<BTreeMap<String, serde_json::Value>>,
}

impl ModulePool {
    fn acquire(&self) -> Result<Box<dyn ExpressionEvaluator>> {
        for attempt in 0..ACQUIRE_ATTEMPTS {
            if let Some(evaluator) = self.idle.lock().pop() {
                return Ok(evaluator);
            }
            {
                let mut outstanding = self.outstanding.lock();
                if *outstanding < self.capacity {
                    *outstanding += 1;
                    drop(outstanding);
                    return self.module.instantiate();
                }
            }
            if attempt + 1 < ACQUIRE_ATTEMPTS {
                std::thread::sleep(ACQUIRE_BACKOFF);
            }
        }
        Err(Error::Overloaded(
            "expression evaluator pool exhausted".to_string(),
        ))
    }

    fn release(&self, evaluator: Box<dyn ExpressionEvaluator>) {
        self.idle.lock().push(evaluator);
    }
}

/// Registry of expression modules, shared by every shard on a node.
#[derive(Default)]
pub struct ExprRegistry {
    pools: RwLock<HashMap<String, Arc<ModulePool>>>,
}

impl ExprRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        module: Arc<dyn ExpressionModule>,
        pool_size: usize,
    ) {
        let pool = Arc::new(ModulePool {
            module,
            idle: Mutex::new(Vec::new()),
            outstanding: Mutex::new(0),
            capacity: pool_size.max(1),
            registers: Mutex::new(BTreeMap::new()),
        });
        self.pools.write().insert(name.into(), pool);
    }

    /// Run `f` with a pooled evaluator for the named module. The instance
    /// returns to the pool afterwards, also on error.
    pub fn with_evaluator<R>(
        &self,
        module: &str,
        f: impl FnOnce(&mut dyn ExpressionEvaluator) -> Result<R>,
    ) -> Result<R> {
        let pool = self
            .pools
            .read()
            .get(module)
            .cloned()
            .ok_or_else(|| {
                Error::parse(
                    "query.user_defined",
                    format!("unknown expression module `{}`", module),
                )
            })?;
        let mut evaluator = pool.acquire()?;
        let result = f(evaluator.as_mut());
        pool.release(evaluator);
        result
    }

    /// Read or write a module's shared register.
    pub fn register_value(&self, module: &str, key: &str) -> Option<serde_json::Value> {
        let pool = self.pools.read().get(module).cloned()?;
        let registers = pool.registers.lock();
        registers.get(key).cloned()
    }

    pub fn set_register_value(
        &self,
        module: &str,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> bool {
        match self.pools.read().get(module) {
            Some(pool) => {
                pool.registers.lock().insert(key.into(), value);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Test module: payload is a JSON object of field -> expected value.
    struct FieldEqualsModule;

    struct FieldEqualsEvaluator;

    impl ExpressionEvaluator for FieldEqualsEvaluator {
        fn matches(&mut self, payload: &[u8], source: &JsonMap) -> Result<bool> {
            let expected: serde_json::Value = serde_json::from_slice(payload)?;
            let Some(expected) = expected.as_object() else {
                return Ok(false);
            };
            Ok(expected
                .iter()
                .all(|(field, value)| source.get(field) == Some(value)))
        }
    }

    impl ExpressionModule for FieldEqualsModule {
        fn instantiate(&self) -> Result<Box<dyn ExpressionEvaluator>> {
            Ok(Box::new(FieldEqualsEvaluator))
        }
    }

    #[test]
    fn test_evaluate_through_pool() {
        let registry = ExprRegistry::new();
        registry.register("field_equals", Arc::new(FieldEqualsModule), 2);

        let payload = serde_json::to_vec(&json!({"color": "red"})).unwrap();
        let doc = json!({"color": "red", "size": 4});
        let matched = registry
            .with_evaluator("field_equals", |evaluator| {
                evaluator.matches(&payload, doc.as_object().unwrap())
            })
            .unwrap();
        assert!(matched);
    }

    #[test]
    fn test_unknown_module_is_parse_error() {
        let registry = ExprRegistry::new();
        let err = registry
            .with_evaluator("missing", |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn test_pool_reuses_instances() {
        let registry = ExprRegistry::new();
        registry.register("field_equals", Arc::new(FieldEqualsModule), 1);
        let payload = serde_json::to_vec(&json!({})).unwrap();
        let doc = serde_json::Map::new();
        for _ in 0..10 {
            registry
                .with_evaluator("field_equals", |evaluator| {
                    evaluator.matches(&payload, &doc)
                })
                .unwrap();
        }
    }

    #[test]
    fn test_registers_are_separate_from_pool() {
        let registry = ExprRegistry::new();
        registry.register("field_equals", Arc::new(FieldEqualsModule), 1);
        assert!(registry.set_register_value("field_equals", "threshold", json!(5)));
        assert_eq!(
            registry.register_value("field_equals", "threshold"),
            Some(json!(5))
        );
        assert_eq!(registry.register_value("field_equals", "missing"), None);
        assert!(!registry.set_register_value("other", "k", json!(1)));
    }
}
