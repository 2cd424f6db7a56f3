use std::collections::HashMap;

use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::{Map, Value};

use super::{JoinSpec, render_scalar};
use crate::debug_log;
use crate::dispatch::{Dispatcher, Keyed};
use crate::error::QueryError;

const KEY_SEPARATOR: &str = "|";

impl JoinSpec {
    /// Compound join key for a record. Missing values contribute an empty part.
    pub fn key_for(&self, record: &Value) -> String {
        self.key_paths()
            .iter()
            .map(|path| render_scalar(&path.eval(record)))
            .collect::<Vec<_>>()
            .join(KEY_SEPARATOR)
    }

    /// Arguments for the secondary call made on behalf of `record`.
    pub fn args_for(&self, record: &Value) -> Map<String, Value> {
        let mut args = self.extra_args.clone();
        for path in self.key_paths() {
            if let Some(leaf) = path.leaf_name() {
                args.insert(leaf.to_string(), path.eval(record));
            }
        }
        args
    }

    /// The part of a secondary response merged into the root record.
    fn enrichment(response: Value, store_root: bool) -> Option<Map<String, Value>> {
        let Value::Object(map) = response else {
            return None;
        };
        if store_root {
            return (!map.is_empty()).then_some(map);
        }

        let (name, first) = map.into_iter().next()?;
        match first {
            Value::Object(inner) => Some(inner),
            Value::Null => None,
            other => {
                let mut wrapped = Map::new();
                wrapped.insert(name, other);
                Some(wrapped)
            }
        }
    }
}

/// Run one join over `records` in place.
///
/// All secondary calls are issued together, at most `concurrency` at a time.
/// Results are matched back by key, not by position. The first failed call
/// aborts the join.
pub(super) async fn apply(
    dispatcher: &Dispatcher,
    join: &JoinSpec,
    store_root: bool,
    records: &mut [Value],
    concurrency: usize,
) -> Result<(), QueryError> {
    if let Some(index) = records.iter().position(|r| !r.is_object()) {
        return Err(QueryError::validation(format!(
            "cannot join {} onto record {index}: not an object",
            join.operation
        )));
    }

    let keys: Vec<String> = records.iter().map(|r| join.key_for(r)).collect();
    let calls: Vec<(String, Map<String, Value>)> = records
        .iter()
        .zip(&keys)
        .map(|(record, key)| (key.clone(), join.args_for(record)))
        .collect();

    debug_log::join(
        "FANOUT",
        &format!("{} x{} (concurrency {concurrency})", join.operation, calls.len()),
    );

    let results: Vec<Keyed<Value>> = stream::iter(calls)
        .map(|(key, args)| async move {
            dispatcher
                .call_keyed(&join.operation, &args, Some(key))
                .await
        })
        .buffer_unordered(concurrency.max(1))
        .try_collect()
        .await?;

    let lookup: HashMap<String, Map<String, Value>> = results
        .into_iter()
        .filter_map(|keyed| Some((keyed.join_key?, JoinSpec::enrichment(keyed.value, store_root)?)))
        .collect();

    for (record, key) in records.iter_mut().zip(&keys) {
        if let (Some(fields), Value::Object(target)) = (lookup.get(key), record) {
            for (name, value) in fields {
                target.insert(name.clone(), value.clone());
            }
        }
    }

    Ok(())
}
