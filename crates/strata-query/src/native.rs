//! Pass-through translator for native SQL.
//!
//! Native statements are executed as written, except that placeholders are
//! normalized to `?`:
//!
//! - `?` is an ordinal parameter;
//! - `?1`, `?2` are named parameters addressed by number;
//! - `:name` is a named parameter (`::` casts are left alone).
//!
//! Text inside single or double quotes is never scanned. Query spaces are the
//! tables named after `FROM`, `JOIN`, `INTO` and `UPDATE`.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;
use strata_core::{
    Error, MappingErrorKind, NamedParameterDescriptor, ParamSlot, ParameterMetadata,
    QueryTranslator, Result, StatementKind, TranslatedQuery, TranslationRequest,
};

/// Patterns are literals; a failure to compile is a programming error.
fn compiled(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static regex pattern"))
}

fn table_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    compiled(&RE, r"(?i)\b(?:from|join|into|update)\s+([A-Za-z_][A-Za-z0-9_.]*)")
}

fn tail_clause_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    compiled(&RE, r"(?i)\b(?:group\s+by|order\s+by|limit)\b")
}

fn where_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    compiled(&RE, r"(?i)\bwhere\b")
}

/// One placeholder found in query text.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Placeholder {
    Ordinal,
    Named { name: String, jpa_style: bool },
}

/// Result of scanning query text.
#[derive(Debug, Default)]
struct Scan {
    sql: String,
    placeholders: Vec<(usize, Placeholder)>,
}

fn scan(text: &str) -> Scan {
    let chars: Vec<char> = text.chars().collect();
    let mut out = Scan {
        sql: String::with_capacity(text.len()),
        placeholders: Vec::new(),
    };
    let mut quote: Option<char> = None;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if let Some(q) = quote {
            out.sql.push(c);
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                out.sql.push(c);
                i += 1;
            }
            ':' if chars.get(i + 1) == Some(&':') => {
                out.sql.push_str("::");
                i += 2;
            }
            ':' if chars
                .get(i + 1)
                .is_some_and(|n| n.is_alphabetic() || *n == '_') =>
            {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                out.placeholders.push((
                    i,
                    Placeholder::Named {
                        name,
                        jpa_style: false,
                    },
                ));
                out.sql.push('?');
                i = end;
            }
            '?' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end].is_ascii_digit() {
                    end += 1;
                }
                if end > start {
                    let name: String = chars[start..end].iter().collect();
                    out.placeholders.push((
                        i,
                        Placeholder::Named {
                            name,
                            jpa_style: true,
                        },
                    ));
                } else {
                    out.placeholders.push((i, Placeholder::Ordinal));
                }
                out.sql.push('?');
                i = end;
            }
            _ => {
                out.sql.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Mapping of a collection role to the table holding its elements.
#[derive(Debug, Clone)]
struct CollectionTable {
    table: String,
    owner_column: String,
    element_entity: Option<String>,
}

/// Entity mapped onto a table.
#[derive(Debug, Clone)]
struct EntityTable {
    entity: String,
    id_column: String,
}

/// Translator for native SQL and collection filters.
#[derive(Debug, Clone, Default)]
pub struct NativeSqlTranslator {
    entities: BTreeMap<String, EntityTable>,
    collections: BTreeMap<String, CollectionTable>,
    filters: BTreeMap<String, String>,
}

impl NativeSqlTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows selected from `table` hydrate into `entity`.
    #[must_use]
    pub fn with_entity(
        mut self,
        table: impl Into<String>,
        entity: impl Into<String>,
        id_column: impl Into<String>,
    ) -> Self {
        self.entities.insert(
            table.into().to_lowercase(),
            EntityTable {
                entity: entity.into(),
                id_column: id_column.into(),
            },
        );
        self
    }

    /// Elements of `role` live in `table`, keyed to their owner by `owner_column`.
    #[must_use]
    pub fn with_collection(
        mut self,
        role: impl Into<String>,
        table: impl Into<String>,
        owner_column: impl Into<String>,
        element_entity: Option<String>,
    ) -> Self {
        self.collections.insert(
            role.into(),
            CollectionTable {
                table: table.into(),
                owner_column: owner_column.into(),
                element_entity,
            },
        );
        self
    }

    /// A filter condition appended to statements while the filter is enabled.
    #[must_use]
    pub fn with_filter(mut self, name: impl Into<String>, condition: impl Into<String>) -> Self {
        self.filters.insert(name.into(), condition.into());
        self
    }

    pub fn filter_names(&self) -> impl Iterator<Item = &str> {
        self.filters.keys().map(String::as_str)
    }

    fn apply_filters(&self, sql: String, enabled: &BTreeSet<String>) -> String {
        let conditions: Vec<&str> = enabled
            .iter()
            .filter_map(|name| self.filters.get(name).map(String::as_str))
            .collect();
        if conditions.is_empty() {
            return sql;
        }
        let joined = conditions
            .iter()
            .map(|c| format!("({c})"))
            .collect::<Vec<_>>()
            .join(" and ");
        let split = tail_clause_regex()
            .find(&sql)
            .map_or(sql.len(), |m| m.start());
        let (head, tail) = sql.split_at(split);
        let head = head.trim_end();
        let connector = if where_regex().is_match(head) {
            "and"
        } else {
            "where"
        };
        if tail.is_empty() {
            format!("{head} {connector} {joined}")
        } else {
            format!("{head} {connector} {joined} {tail}")
        }
    }

    fn collection_base(&self, role: &str, filter: &str) -> Result<(String, Option<String>)> {
        let mapping = self.collections.get(role).ok_or_else(|| {
            Error::mapping(
                MappingErrorKind::UnknownCollection,
                None,
                format!("Unknown collection role: {role}"),
            )
        })?;
        let base = format!(
            "select * from {} where {} = ?",
            mapping.table, mapping.owner_column
        );
        let filter = filter.trim();
        let sql = if filter.is_empty() {
            base
        } else if let Some(rest) = filter
            .get(..6)
            .filter(|head| head.eq_ignore_ascii_case("where "))
            .map(|_| &filter[6..])
        {
            format!("{base} and {rest}")
        } else {
            format!("{base} {filter}")
        };
        Ok((sql, mapping.element_entity.clone()))
    }

    fn shallow_projection(&self, sql: &str, entity: &EntityTable) -> String {
        let lower = sql.to_lowercase();
        match (lower.find("select"), lower.find(" from ")) {
            (Some(s), Some(f)) if s < f => format!(
                "{}select {}{}",
                &sql[..s],
                entity.id_column,
                &sql[f..]
            ),
            _ => sql.to_string(),
        }
    }
}

impl QueryTranslator for NativeSqlTranslator {
    fn parameter_metadata(&self, text: &str) -> Result<ParameterMetadata> {
        let scanned = scan(text);
        let mut ordinals = 0usize;
        let mut named: BTreeMap<String, NamedParameterDescriptor> = BTreeMap::new();
        for (offset, placeholder) in scanned.placeholders {
            match placeholder {
                Placeholder::Ordinal => ordinals += 1,
                Placeholder::Named { name, jpa_style } => {
                    named
                        .entry(name.clone())
                        .or_insert_with(|| NamedParameterDescriptor {
                            name,
                            expected_type: None,
                            locations: Vec::new(),
                            jpa_style,
                        })
                        .locations
                        .push(offset);
                }
            }
        }
        Ok(ParameterMetadata::new(vec![None; ordinals], named.into_values()))
    }

    fn translate(&self, request: &TranslationRequest<'_>) -> Result<TranslatedQuery> {
        let scanned = scan(request.text);

        // Collection filters reserve ordinal 0 for the owner key.
        let (sql, element_entity, mut next_ordinal, mut slots) = match request.collection_role {
            Some(role) => {
                let (sql, element) = self.collection_base(role, &scanned.sql)?;
                (sql, element, 1usize, vec![ParamSlot::Positional(0)])
            }
            None => (scanned.sql, None, 0usize, Vec::new()),
        };
        for (_, placeholder) in scanned.placeholders {
            slots.push(match placeholder {
                Placeholder::Ordinal => {
                    let slot = ParamSlot::Positional(next_ordinal);
                    next_ordinal += 1;
                    slot
                }
                Placeholder::Named { name, .. } => ParamSlot::Named(name),
            });
        }

        let query_spaces: BTreeSet<String> = table_regex()
            .captures_iter(&sql)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_lowercase()))
            .collect();

        let trimmed = sql.trim_start().to_lowercase();
        let kind = if trimmed.starts_with("select") || trimmed.starts_with("with") {
            StatementKind::Select
        } else {
            StatementKind::Update
        };

        let first_table = table_regex()
            .captures(&sql)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_lowercase());
        let mapped = first_table.as_ref().and_then(|t| self.entities.get(t));
        let returned_entity = match kind {
            StatementKind::Select => element_entity.or_else(|| mapped.map(|m| m.entity.clone())),
            StatementKind::Update => None,
        };

        let mut sql = self.apply_filters(sql, request.enabled_filters);
        if request.shallow && kind == StatementKind::Select {
            if let Some(entity) = mapped {
                sql = self.shallow_projection(&sql, entity);
            }
        }

        Ok(TranslatedQuery {
            sql,
            slots,
            query_spaces,
            kind,
            returned_entity,
            fetches_collection: false,
        })
    }
}
