//! Typed parameter binding, verification and named-list expansion.
//!
//! Two addressing schemes coexist:
//!
//! - **positional** slots (0-based), with explicit `Unset` gaps;
//! - **named** bindings, plus a separate map for list-valued names.
//!
//! Type resolution for a value bound without an explicit type:
//!
//! | value    | resolution order                                               |
//! |----------|----------------------------------------------------------------|
//! | null     | declared type, else the untyped fallback                       |
//! | non-null | declared type, else heuristic, else mapped entity, else error  |
//!
//! List expansion never mutates the binder: [`ParameterBinder::expand`]
//! returns a rewritten copy of the text and a copy of the named bindings.

use crate::parameters::{QueryParameters, TypedValue};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use strata_core::{
    BindingErrorKind, EntityResolver, Error, ParameterMetadata, Result, TypeRegistry,
    UsageErrorKind, Value, ValueType,
};

/// One positional slot.
#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Unset,
    Bound(TypedValue),
}

/// A list-valued named binding.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedList {
    pub values: Vec<Value>,
    pub value_type: ValueType,
}

/// Query text and named bindings after list expansion.
#[derive(Debug, Clone)]
pub struct ExpandedQuery {
    pub text: String,
    pub named: BTreeMap<String, TypedValue>,
    /// Whether the text differs from the original.
    pub rewritten: bool,
}

/// Collects parameter bindings for one query.
#[derive(Clone)]
pub struct ParameterBinder {
    query: String,
    metadata: Arc<ParameterMetadata>,
    types: Arc<TypeRegistry>,
    entities: Option<Arc<dyn EntityResolver>>,
    positional: Vec<Slot>,
    named: BTreeMap<String, TypedValue>,
    named_lists: BTreeMap<String, TypedList>,
    in_expression_limit: Option<usize>,
}

impl std::fmt::Debug for ParameterBinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterBinder")
            .field("query", &self.query)
            .field("positional", &self.positional)
            .field("named", &self.named)
            .field("named_lists", &self.named_lists)
            .finish_non_exhaustive()
    }
}

impl ParameterBinder {
    pub fn new(
        query: impl Into<String>,
        metadata: Arc<ParameterMetadata>,
        types: Arc<TypeRegistry>,
    ) -> Self {
        Self {
            query: query.into(),
            metadata,
            types,
            entities: None,
            positional: Vec::new(),
            named: BTreeMap::new(),
            named_lists: BTreeMap::new(),
            in_expression_limit: None,
        }
    }

    #[must_use]
    pub fn with_entity_resolver(mut self, resolver: Arc<dyn EntityResolver>) -> Self {
        self.entities = Some(resolver);
        self
    }

    /// Warn when a list expands beyond this many elements.
    #[must_use]
    pub fn with_in_expression_limit(mut self, limit: Option<usize>) -> Self {
        self.in_expression_limit = limit;
        self
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn metadata(&self) -> &ParameterMetadata {
        &self.metadata
    }

    // ========================================================================
    // Positional
    // ========================================================================

    /// Bind a positional parameter, resolving its type.
    pub fn set_positional(&mut self, position: usize, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.check_position(position)?;
        let expected = self.metadata.ordinal_expected_type(position).cloned();
        let value_type = self.resolve_type(&value, expected.as_ref(), &position.to_string())?;
        self.put_positional(position, TypedValue::new(value, value_type));
        Ok(())
    }

    /// Bind a positional parameter with an explicit type.
    pub fn set_positional_typed(
        &mut self,
        position: usize,
        value: impl Into<Value>,
        value_type: ValueType,
    ) -> Result<()> {
        self.check_position(position)?;
        self.put_positional(position, TypedValue::new(value.into(), value_type));
        Ok(())
    }

    fn check_position(&self, position: usize) -> Result<()> {
        let count = self.metadata.ordinal_count();
        if count == 0 {
            return Err(Error::binding(
                BindingErrorKind::UnknownPosition,
                &self.query,
                Some(position.to_string()),
                "No positional parameters in query",
            ));
        }
        if position >= count {
            return Err(Error::binding(
                BindingErrorKind::UnknownPosition,
                &self.query,
                Some(position.to_string()),
                format!(
                    "Positional parameter does not exist: {} (query has {} positional parameters)",
                    position, count
                ),
            ));
        }
        Ok(())
    }

    fn put_positional(&mut self, position: usize, value: TypedValue) {
        if self.positional.len() <= position {
            self.positional.resize(position + 1, Slot::Unset);
        }
        self.positional[position] = Slot::Bound(value);
    }

    // ========================================================================
    // Named
    // ========================================================================

    /// Bind a named parameter, resolving its type.
    pub fn set_named(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.check_name(name)?;
        let expected = self.metadata.named_expected_type(name).cloned();
        let value_type = self.resolve_type(&value, expected.as_ref(), name)?;
        self.named_lists.remove(name);
        self.named
            .insert(name.to_string(), TypedValue::new(value, value_type));
        Ok(())
    }

    /// Bind a named parameter with an explicit type.
    pub fn set_named_typed(
        &mut self,
        name: &str,
        value: impl Into<Value>,
        value_type: ValueType,
    ) -> Result<()> {
        self.check_name(name)?;
        self.named_lists.remove(name);
        self.named
            .insert(name.to_string(), TypedValue::new(value.into(), value_type));
        Ok(())
    }

    /// Bind a list to a named parameter; expanded at execution time.
    ///
    /// The element type is resolved from the first non-null element.
    pub fn set_parameter_list(&mut self, name: &str, values: Vec<Value>) -> Result<()> {
        self.check_name(name)?;
        self.check_list(name, &values)?;
        let expected = self.metadata.named_expected_type(name).cloned();
        let sample = values
            .iter()
            .find(|v| !v.is_null())
            .cloned()
            .unwrap_or(Value::Null);
        let value_type = self.resolve_type(&sample, expected.as_ref(), name)?;
        self.named.remove(name);
        self.named_lists
            .insert(name.to_string(), TypedList { values, value_type });
        Ok(())
    }

    pub fn set_parameter_list_typed(
        &mut self,
        name: &str,
        values: Vec<Value>,
        value_type: ValueType,
    ) -> Result<()> {
        self.check_name(name)?;
        self.check_list(name, &values)?;
        self.named.remove(name);
        self.named_lists
            .insert(name.to_string(), TypedList { values, value_type });
        Ok(())
    }

    /// Bind every named parameter of the query present in `properties`.
    /// Array values are bound as lists.
    pub fn set_properties(&mut self, properties: &BTreeMap<String, Value>) -> Result<()> {
        for name in self.metadata.named_parameter_names() {
            match properties.get(&name) {
                Some(Value::Array(items)) => self.set_parameter_list(&name, items.clone())?,
                Some(value) => self.set_named(&name, value.clone())?,
                None => {}
            }
        }
        Ok(())
    }

    pub fn named_parameter_names(&self) -> BTreeSet<String> {
        self.metadata.named_parameter_names()
    }

    pub fn named_value(&self, name: &str) -> Option<&TypedValue> {
        self.named.get(name)
    }

    pub fn named_list(&self, name: &str) -> Option<&TypedList> {
        self.named_lists.get(name)
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if self.metadata.has_named(name) {
            Ok(())
        } else {
            Err(Error::binding(
                BindingErrorKind::UnknownName,
                &self.query,
                Some(name.to_string()),
                format!("Parameter {name} does not exist as a named parameter"),
            ))
        }
    }

    fn check_list(&self, name: &str, values: &[Value]) -> Result<()> {
        if values.is_empty() {
            return Err(Error::usage(
                UsageErrorKind::MalformedList,
                format!("Empty list bound to parameter {name} in [{}]", self.query),
            ));
        }
        Ok(())
    }

    // ========================================================================
    // Type resolution
    // ========================================================================

    fn resolve_type(
        &self,
        value: &Value,
        expected: Option<&ValueType>,
        parameter: &str,
    ) -> Result<ValueType> {
        if value.is_null() {
            return Ok(expected.cloned().unwrap_or(ValueType::Untyped));
        }
        if let Some(t) = expected {
            return Ok(t.clone());
        }
        if let Some(t) = self.types.heuristic(value) {
            return Ok(t);
        }
        if let (Value::Object(obj), Some(resolver)) = (value, &self.entities) {
            if let Some(t) = resolver.entity_type(&obj.descriptor) {
                return Ok(t);
            }
        }
        Err(Error::binding(
            BindingErrorKind::UndeterminedType,
            &self.query,
            Some(parameter.to_string()),
            format!(
                "Could not determine a type for class: {} (parameter {})",
                value.type_name(),
                parameter
            ),
        ))
    }

    // ========================================================================
    // Verification
    // ========================================================================

    /// Check that every named parameter is bound and that the positional
    /// column span matches the ordinal count.
    ///
    /// With `reserve_first`, slot 0 is a return-value or owner-key placeholder:
    /// it may be unset and is not required to be counted.
    pub fn verify(&self, reserve_first: bool) -> Result<()> {
        let missing: Vec<String> = self
            .metadata
            .named_parameter_names()
            .into_iter()
            .filter(|n| !self.named.contains_key(n) && !self.named_lists.contains_key(n))
            .collect();
        if !missing.is_empty() {
            return Err(Error::binding(
                BindingErrorKind::MissingNamed,
                &self.query,
                Some(missing.join(", ")),
                format!(
                    "Not all named parameters have been set: [{}]",
                    missing.join(", ")
                ),
            ));
        }

        let mut span = 0usize;
        for (i, slot) in self.positional.iter().enumerate() {
            match slot {
                Slot::Unset if reserve_first && i == 0 => {}
                Slot::Unset => {
                    return Err(Error::binding(
                        BindingErrorKind::UnsetPositional,
                        &self.query,
                        Some(i.to_string()),
                        format!("Unset positional parameter at position: {i}"),
                    ));
                }
                Slot::Bound(v) => span += v.column_span(),
            }
        }

        let expected = self.metadata.ordinal_count();
        let matches = span == expected || (reserve_first && expected.checked_sub(1) == Some(span));
        if !matches {
            return Err(Error::binding(
                BindingErrorKind::PositionalCount,
                &self.query,
                None,
                format!(
                    "Expected positional parameter count: {}, actual parameters: {}",
                    expected, span
                ),
            ));
        }
        Ok(())
    }

    // ========================================================================
    // Expansion
    // ========================================================================

    /// Rewrite list-valued parameters into synthetic scalar bindings.
    ///
    /// `:ids` bound to `[1, 2, 3]` becomes `:ids0_, :ids1_, :ids2_` in a copy of
    /// the text. A single-element list is bound as a plain scalar under the
    /// original name without touching the text.
    pub fn expand(&self) -> Result<ExpandedQuery> {
        let mut text = self.query.clone();
        let mut named = self.named.clone();
        let mut rewritten = false;

        for (name, list) in &self.named_lists {
            if let Some(limit) = self.in_expression_limit {
                if list.values.len() > limit {
                    tracing::warn!(
                        parameter = %name,
                        size = list.values.len(),
                        limit,
                        "parameter list exceeds the in-expression limit of the store"
                    );
                }
            }

            if list.values.len() == 1 {
                named.insert(
                    name.clone(),
                    TypedValue::new(list.values[0].clone(), list.value_type.clone()),
                );
                continue;
            }

            let placeholder = format!(":{name}");
            if find_placeholder(&text, &placeholder, 0).is_none() {
                continue;
            }

            let mut aliases = Vec::with_capacity(list.values.len());
            for (i, value) in list.values.iter().enumerate() {
                let alias = format!("{name}{i}_");
                let previous = named.insert(
                    alias.clone(),
                    TypedValue::new(value.clone(), list.value_type.clone()),
                );
                if previous.is_some() {
                    return Err(Error::binding(
                        BindingErrorKind::RepeatedAlias,
                        &self.query,
                        Some(alias.clone()),
                        format!("Repeated usage of alias '{alias}' while expanding list parameter"),
                    ));
                }
                aliases.push(format!(":{alias}"));
            }
            text = replace_placeholder(&text, &placeholder, &aliases.join(", "));
            rewritten = true;
        }

        Ok(ExpandedQuery {
            text,
            named,
            rewritten,
        })
    }

    /// Snapshot the positional bindings plus the given (expanded) named
    /// bindings. Unset slots become untyped nulls.
    pub fn to_query_parameters(&self, named: BTreeMap<String, TypedValue>) -> QueryParameters {
        let positional = self
            .positional
            .iter()
            .map(|slot| match slot {
                Slot::Unset => TypedValue::unset(),
                Slot::Bound(v) => v.clone(),
            })
            .collect();
        QueryParameters::new(positional, named)
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Find `placeholder` at or after `from` as a whole word.
fn find_placeholder(text: &str, placeholder: &str, from: usize) -> Option<usize> {
    let mut start = from;
    while let Some(rel) = text[start..].find(placeholder) {
        let at = start + rel;
        let end = at + placeholder.len();
        let whole = text[end..].chars().next().is_none_or(|c| !is_ident_char(c));
        if whole {
            return Some(at);
        }
        start = end;
    }
    None
}

fn replace_placeholder(text: &str, placeholder: &str, replacement: &str) -> String {
    let mut out = String::with_capacity(text.len() + replacement.len());
    let mut cursor = 0;
    while let Some(at) = find_placeholder(text, placeholder, cursor) {
        out.push_str(&text[cursor..at]);
        out.push_str(replacement);
        cursor = at + placeholder.len();
    }
    out.push_str(&text[cursor..]);
    out
}
