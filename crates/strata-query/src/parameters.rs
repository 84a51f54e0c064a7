//! Immutable parameter bundles handed to statement execution.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use strata_core::{
    BindingErrorKind, Error, LockOptions, ParamSlot, Result, Value, ValueType,
};

/// A value together with the type it is bound as.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedValue {
    pub value: Value,
    pub value_type: ValueType,
}

impl TypedValue {
    pub fn new(value: Value, value_type: ValueType) -> Self {
        Self { value, value_type }
    }

    /// Placeholder for a positional slot reserved by the caller.
    pub fn unset() -> Self {
        Self {
            value: Value::Null,
            value_type: ValueType::Untyped,
        }
    }

    pub fn column_span(&self) -> usize {
        self.value_type.column_span()
    }

    /// Physical column values for this binding.
    pub fn flatten(&self) -> Result<Vec<Value>> {
        self.value_type.flatten(&self.value)
    }
}

/// Limit / offset / fetch size / timeout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RowSelection {
    pub first_row: Option<usize>,
    pub max_rows: Option<usize>,
    pub fetch_size: Option<usize>,
    pub timeout: Option<Duration>,
}

impl RowSelection {
    pub fn is_empty(&self) -> bool {
        self.first_row.is_none() && self.max_rows.is_none()
    }
}

/// Everything needed to execute one statement besides its text.
#[derive(Debug, Clone, Default)]
pub struct QueryParameters {
    positional: Vec<TypedValue>,
    named: BTreeMap<String, TypedValue>,
    selection: RowSelection,
    lock_options: LockOptions,
    cacheable: bool,
    cache_region: Option<String>,
    read_only: Option<bool>,
    callable: bool,
}

impl QueryParameters {
    pub fn new(positional: Vec<TypedValue>, named: BTreeMap<String, TypedValue>) -> Self {
        Self {
            positional,
            named,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_selection(mut self, selection: RowSelection) -> Self {
        self.selection = selection;
        self
    }

    #[must_use]
    pub fn with_lock_options(mut self, lock_options: LockOptions) -> Self {
        self.lock_options = lock_options;
        self
    }

    #[must_use]
    pub fn with_cacheable(mut self, cacheable: bool, region: Option<String>) -> Self {
        self.cacheable = cacheable;
        self.cache_region = region;
        self
    }

    #[must_use]
    pub fn with_read_only(mut self, read_only: Option<bool>) -> Self {
        self.read_only = read_only;
        self
    }

    #[must_use]
    pub fn with_callable(mut self, callable: bool) -> Self {
        self.callable = callable;
        self
    }

    /// Replace the binding of one positional slot, growing the slot list if
    /// needed. Used to fill a reserved leading slot.
    #[must_use]
    pub fn with_positional(mut self, position: usize, value: TypedValue) -> Self {
        if self.positional.len() <= position {
            self.positional.resize(position + 1, TypedValue::unset());
        }
        self.positional[position] = value;
        self
    }

    pub fn positional(&self) -> &[TypedValue] {
        &self.positional
    }

    pub fn named(&self) -> &BTreeMap<String, TypedValue> {
        &self.named
    }

    pub fn selection(&self) -> &RowSelection {
        &self.selection
    }

    pub fn lock_options(&self) -> &LockOptions {
        &self.lock_options
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    pub fn cache_region(&self) -> Option<&str> {
        self.cache_region.as_deref()
    }

    pub fn read_only(&self) -> Option<bool> {
        self.read_only
    }

    pub fn is_callable(&self) -> bool {
        self.callable
    }

    /// Flatten bindings into statement parameters following the translated
    /// placeholder order.
    ///
    /// Ordinal placeholders address physical columns: a binding spanning
    /// several columns covers that many consecutive ordinals.
    pub fn bind_slots(&self, slots: &[ParamSlot], query: &str) -> Result<Vec<Value>> {
        let mut params = Vec::with_capacity(slots.len());
        for slot in slots {
            match slot {
                ParamSlot::Positional(ordinal) => params.push(self.positional_column(*ordinal, query)?),
                ParamSlot::Named(name) => {
                    let bound = self.named.get(name).ok_or_else(|| {
                        Error::binding(
                            BindingErrorKind::MissingNamed,
                            query,
                            Some(name.clone()),
                            format!("No value bound for named parameter: {name}"),
                        )
                    })?;
                    params.extend(bound.flatten()?);
                }
            }
        }
        Ok(params)
    }

    /// Column value behind ordinal placeholder `ordinal`, walking the
    /// cumulative column span of the positional bindings.
    fn positional_column(&self, ordinal: usize, query: &str) -> Result<Value> {
        let mut start = 0usize;
        for binding in &self.positional {
            let span = binding.column_span();
            if ordinal < start + span {
                if let Some(value) = binding.flatten()?.into_iter().nth(ordinal - start) {
                    return Ok(value);
                }
                break;
            }
            start += span;
        }
        Err(Error::binding(
            BindingErrorKind::UnsetPositional,
            query,
            Some(ordinal.to_string()),
            format!("Unset positional parameter at position: {ordinal}"),
        ))
    }

    /// Hash of the statement and its flattened parameters, used as the
    /// query result cache key.
    pub fn result_cache_key(&self, sql: &str, params: &[Value]) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        sql.hash(&mut hasher);
        params.len().hash(&mut hasher);
        for p in params {
            p.hash_into(&mut hasher);
        }
        self.selection.hash(&mut hasher);
        hasher.finish()
    }
}
