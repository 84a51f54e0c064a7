//! Operation handler pipeline.
//!
//! Every session operation belongs to one [`OperationKind`]. Handlers are
//! registered per kind and [`Stage`] and run in registration order around
//! the operation's own work. A `Pre` handler returning `Err` aborts the
//! operation before anything is changed; a `Post` handler error is returned
//! to the caller after the operation took effect.

use std::collections::HashMap;
use std::fmt;
use strata_core::{EntityRef, Result, Value};

/// Closed set of session operations that fire handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationKind {
    Save,
    Persist,
    Update,
    SaveOrUpdate,
    Delete,
    Load,
    Merge,
    Refresh,
    Evict,
    Lock,
    Flush,
    AutoFlush,
    InitializeCollection,
    Commit,
    Rollback,
}

impl OperationKind {
    pub const ALL: [OperationKind; 15] = [
        OperationKind::Save,
        OperationKind::Persist,
        OperationKind::Update,
        OperationKind::SaveOrUpdate,
        OperationKind::Delete,
        OperationKind::Load,
        OperationKind::Merge,
        OperationKind::Refresh,
        OperationKind::Evict,
        OperationKind::Lock,
        OperationKind::Flush,
        OperationKind::AutoFlush,
        OperationKind::InitializeCollection,
        OperationKind::Commit,
        OperationKind::Rollback,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Save => "save",
            OperationKind::Persist => "persist",
            OperationKind::Update => "update",
            OperationKind::SaveOrUpdate => "save_or_update",
            OperationKind::Delete => "delete",
            OperationKind::Load => "load",
            OperationKind::Merge => "merge",
            OperationKind::Refresh => "refresh",
            OperationKind::Evict => "evict",
            OperationKind::Lock => "lock",
            OperationKind::Flush => "flush",
            OperationKind::AutoFlush => "auto_flush",
            OperationKind::InitializeCollection => "initialize_collection",
            OperationKind::Commit => "commit",
            OperationKind::Rollback => "rollback",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Pre,
    Post,
}

/// What a handler sees about the operation.
#[derive(Debug, Clone)]
pub struct OperationEvent {
    pub kind: OperationKind,
    pub stage: Stage,
    pub entity_name: Option<String>,
    pub id: Option<Value>,
    pub entity: Option<EntityRef>,
}

impl OperationEvent {
    pub fn new(kind: OperationKind, stage: Stage) -> Self {
        Self {
            kind,
            stage,
            entity_name: None,
            id: None,
            entity: None,
        }
    }

    /// Event about a specific entity instance.
    pub fn for_entity(kind: OperationKind, stage: Stage, entity: &EntityRef) -> Self {
        let (entity_name, id) = {
            let e = entity.read();
            (e.entity_name().to_string(), e.id().cloned())
        };
        Self {
            kind,
            stage,
            entity_name: Some(entity_name),
            id,
            entity: Some(entity.clone()),
        }
    }

    /// Event about an entity addressed by name and identifier.
    pub fn for_key(kind: OperationKind, stage: Stage, entity_name: &str, id: &Value) -> Self {
        Self {
            kind,
            stage,
            entity_name: Some(entity_name.to_string()),
            id: Some(id.clone()),
            entity: None,
        }
    }

    #[must_use]
    pub fn at(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }
}

/// A registered handler. Returning `Err` aborts (pre) or fails (post).
pub type Handler = Box<dyn FnMut(&OperationEvent) -> Result<()> + Send>;

/// Ordered handlers per (operation kind, stage).
#[derive(Default)]
pub struct HandlerPipeline {
    handlers: HashMap<(OperationKind, Stage), Vec<Handler>>,
}

impl fmt::Debug for HandlerPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut counts: Vec<(String, usize)> = self
            .handlers
            .iter()
            .map(|((kind, stage), hs)| (format!("{kind}:{stage:?}"), hs.len()))
            .collect();
        counts.sort();
        f.debug_struct("HandlerPipeline")
            .field("handlers", &counts)
            .finish()
    }
}

impl HandlerPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        kind: OperationKind,
        stage: Stage,
        handler: impl FnMut(&OperationEvent) -> Result<()> + Send + 'static,
    ) {
        self.handlers
            .entry((kind, stage))
            .or_default()
            .push(Box::new(handler));
    }

    pub fn on_pre(&mut self, kind: OperationKind, handler: impl FnMut(&OperationEvent) -> Result<()> + Send + 'static) {
        self.register(kind, Stage::Pre, handler);
    }

    pub fn on_post(&mut self, kind: OperationKind, handler: impl FnMut(&OperationEvent) -> Result<()> + Send + 'static) {
        self.register(kind, Stage::Post, handler);
    }

    /// Run the handlers registered for the event's kind and stage, stopping
    /// at the first error.
    pub fn fire(&mut self, event: &OperationEvent) -> Result<()> {
        let Some(handlers) = self.handlers.get_mut(&(event.kind, event.stage)) else {
            return Ok(());
        };
        for handler in handlers.iter_mut() {
            handler(event)?;
        }
        Ok(())
    }

    pub fn handler_count(&self, kind: OperationKind, stage: Stage) -> usize {
        self.handlers.get(&(kind, stage)).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.values().all(Vec::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use strata_core::{Entity, Error};

    #[test]
    fn test_handlers_run_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = HandlerPipeline::new();
        for tag in ["a", "b"] {
            let seen = seen.clone();
            pipeline.on_pre(OperationKind::Save, move |_| {
                seen.lock().unwrap().push(tag);
                Ok(())
            });
        }
        pipeline
            .fire(&OperationEvent::new(OperationKind::Save, Stage::Pre))
            .unwrap();
        // Other stage and kind are untouched.
        pipeline
            .fire(&OperationEvent::new(OperationKind::Save, Stage::Post))
            .unwrap();
        pipeline
            .fire(&OperationEvent::new(OperationKind::Delete, Stage::Pre))
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_error_stops_pipeline() {
        let calls = Arc::new(Mutex::new(0));
        let mut pipeline = HandlerPipeline::new();
        pipeline.on_pre(OperationKind::Flush, |_| Err(Error::Custom("veto".into())));
        let c = calls.clone();
        pipeline.on_pre(OperationKind::Flush, move |_| {
            *c.lock().unwrap() += 1;
            Ok(())
        });
        let err = pipeline
            .fire(&OperationEvent::new(OperationKind::Flush, Stage::Pre))
            .unwrap_err();
        assert_eq!(err.to_string(), "veto");
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_entity_event_carries_identity() {
        let entity = EntityRef::new(Entity::new("Customer").with_id(3_i64));
        let event = OperationEvent::for_entity(OperationKind::Delete, Stage::Pre, &entity);
        assert_eq!(event.entity_name.as_deref(), Some("Customer"));
        assert_eq!(event.id, Some(Value::BigInt(3)));
        assert_eq!(event.at(Stage::Post).stage, Stage::Post);
    }

    #[test]
    fn test_debug_shows_counts() {
        let mut pipeline = HandlerPipeline::new();
        pipeline.on_post(OperationKind::Commit, |_| Ok(()));
        assert_eq!(pipeline.handler_count(OperationKind::Commit, Stage::Post), 1);
        assert!(format!("{pipeline:?}").contains("commit:Post"));
        assert_eq!(OperationKind::ALL.len(), 15);
    }
}
