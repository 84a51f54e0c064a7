//! Query translator collaborator and the static parameter metadata it reports.

use crate::error::Result;
use crate::types::ValueType;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A named parameter discovered in query text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamedParameterDescriptor {
    pub name: String,
    /// Type statically inferable from the query, if any.
    pub expected_type: Option<ValueType>,
    /// Character offsets of each occurrence in the text.
    pub locations: Vec<usize>,
    /// `?1`-style parameter addressed by name.
    pub jpa_style: bool,
}

/// Static analysis of a query string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ParameterMetadata {
    ordinal_types: Vec<Option<ValueType>>,
    named: BTreeMap<String, NamedParameterDescriptor>,
}

impl ParameterMetadata {
    pub fn new(
        ordinal_types: Vec<Option<ValueType>>,
        named: impl IntoIterator<Item = NamedParameterDescriptor>,
    ) -> Self {
        Self {
            ordinal_types,
            named: named.into_iter().map(|d| (d.name.clone(), d)).collect(),
        }
    }

    pub fn ordinal_count(&self) -> usize {
        self.ordinal_types.len()
    }

    pub fn ordinal_expected_type(&self, position: usize) -> Option<&ValueType> {
        self.ordinal_types.get(position).and_then(Option::as_ref)
    }

    pub fn named_parameter_names(&self) -> BTreeSet<String> {
        self.named.keys().cloned().collect()
    }

    pub fn named_descriptor(&self, name: &str) -> Option<&NamedParameterDescriptor> {
        self.named.get(name)
    }

    pub fn named_expected_type(&self, name: &str) -> Option<&ValueType> {
        self.named.get(name).and_then(|d| d.expected_type.as_ref())
    }

    pub fn has_named(&self, name: &str) -> bool {
        self.named.contains_key(name)
    }

    /// Copy with an extra untyped ordinal slot in front, for statements whose
    /// first placeholder is filled by the runtime (collection filters).
    #[must_use]
    pub fn reserving_first(&self) -> Self {
        let mut ordinal_types = Vec::with_capacity(self.ordinal_types.len() + 1);
        ordinal_types.push(None);
        ordinal_types.extend(self.ordinal_types.iter().cloned());
        Self {
            ordinal_types,
            named: self.named.clone(),
        }
    }
}

/// Placeholder in translated SQL, in placeholder order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamSlot {
    Positional(usize),
    Named(String),
}

/// Whether a translated statement reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Select,
    Update,
}

/// Output of the translator for one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedQuery {
    /// SQL with `?` placeholders.
    pub sql: String,
    /// Source of each placeholder, in order.
    pub slots: Vec<ParamSlot>,
    /// Tables the statement touches.
    pub query_spaces: BTreeSet<String>,
    pub kind: StatementKind,
    /// Entity type each result row hydrates into, if any.
    pub returned_entity: Option<String>,
    /// Whether a collection is fetch-joined, so one entity spans several
    /// consecutive rows sharing its identifier in the first column.
    pub fetches_collection: bool,
}

/// Inputs to one translation.
#[derive(Debug, Clone, Copy)]
pub struct TranslationRequest<'a> {
    pub text: &'a str,
    /// Shallow queries return identifiers only (used by `iterate`).
    pub shallow: bool,
    pub enabled_filters: &'a BTreeSet<String>,
    /// Collection role when translating a collection filter.
    pub collection_role: Option<&'a str>,
}

/// Compiles query text into statements. The concrete language is opaque to
/// the session.
pub trait QueryTranslator: Send + Sync + fmt::Debug {
    fn parameter_metadata(&self, text: &str) -> Result<ParameterMetadata>;

    fn translate(&self, request: &TranslationRequest<'_>) -> Result<TranslatedQuery>;
}
