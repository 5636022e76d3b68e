//! Client-side callback table
//!
//! Local callables passed as call arguments travel as `{"$callback": id}`
//! descriptors. The table maps those ids back to the callables when the
//! server asks for one to be run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::codec::{CallbackId, Map, Value};

/// A local callable the server may invoke mid-call
pub type Callback = Arc<dyn Fn(Vec<Value>, Map) -> Result<Value, String> + Send + Sync>;

#[derive(Default)]
pub struct CallbackTable {
    next_id: AtomicU64,
    callbacks: Mutex<HashMap<CallbackId, Callback>>,
}

impl CallbackTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `callback` under a fresh id
    pub fn register(&self, callback: Callback) -> CallbackId {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.lock().insert(id, callback);
        id
    }

    pub fn get(&self, id: CallbackId) -> Option<Callback> {
        self.lock().get(&id).cloned()
    }

    pub fn remove(&self, id: CallbackId) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run callback `id`; an unknown id is reported like a failed callback
    pub fn invoke(&self, id: CallbackId, args: Vec<Value>, kwargs: Map) -> Result<Value, String> {
        let callback = self
            .get(id)
            .ok_or_else(|| format!("unknown callback {id}"))?;
        callback(args, kwargs)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CallbackId, Callback>> {
        self.callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_invoke() {
        let table = CallbackTable::new();
        let id = table.register(Arc::new(|args: Vec<Value>, _kwargs: Map| {
            let n = args.first().and_then(Value::as_i64).unwrap_or(0);
            Ok(Value::from(n * 10))
        }));

        assert_eq!(table.invoke(id, vec![Value::from(3)], Map::new()), Ok(Value::from(30)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_ids_are_unique() {
        let table = CallbackTable::new();
        let noop: Callback = Arc::new(|_args: Vec<Value>, _kwargs: Map| Ok(Value::Null));
        let a = table.register(noop.clone());
        let b = table.register(noop);
        assert_ne!(a, b);
    }

    #[test]
    fn test_unknown_and_removed() {
        let table = CallbackTable::new();
        let failing: Callback = Arc::new(|_args: Vec<Value>, _kwargs: Map| Err("nope".to_string()));
        let id = table.register(failing);
        assert_eq!(table.invoke(id, vec![], Map::new()), Err("nope".to_string()));

        assert!(table.remove(id));
        assert!(table.is_empty());
        let err = table.invoke(id, vec![], Map::new()).unwrap_err();
        assert!(err.contains("unknown callback"));
    }
}
