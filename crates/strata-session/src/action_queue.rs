//! Ordered write-behind queue.
//!
//! Actions run in six fixed phases:
//! - inserts, dependencies first (a referenced entity is inserted before the
//!   entity holding the foreign key)
//! - updates
//! - collection removals, updates and recreations
//! - deletes, dependents first
//!
//! A failure part-way through poisons the queue: the failed action and
//! everything after it stay queued, and the queue refuses to run again.

use crate::action::{Action, Completion, Phase};
use crate::context::PersistenceContext;
use crate::snapshot::GraphCopier;
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::sync::Arc;
use strata_core::{
    CacheRegion, Connection, EntityIdentity, EntityRef, Error, Property, Result, UsageErrorKind,
    Value,
};

/// Rows written by one [`ActionQueue::execute`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushStats {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub collections_removed: usize,
    pub collections_updated: usize,
    pub collections_recreated: usize,
}

impl FlushStats {
    pub fn total(&self) -> usize {
        self.inserted
            + self.updated
            + self.deleted
            + self.collections_removed
            + self.collections_updated
            + self.collections_recreated
    }

    fn record(&mut self, phase: Phase, count: usize) {
        match phase {
            Phase::Insertion => self.inserted += count,
            Phase::Update => self.updated += count,
            Phase::CollectionRemoval => self.collections_removed += count,
            Phase::CollectionUpdate => self.collections_updated += count,
            Phase::CollectionRecreation => self.collections_recreated += count,
            Phase::Deletion => self.deleted += count,
        }
    }
}

/// Six per-phase action lists plus the completions of executed actions.
#[derive(Debug, Default)]
pub struct ActionQueue {
    insertions: Vec<Action>,
    updates: Vec<Action>,
    collection_removals: Vec<Action>,
    collection_updates: Vec<Action>,
    collection_creations: Vec<Action>,
    deletions: Vec<Action>,
    completions: Vec<Completion>,
    poisoned: bool,
    order_inserts: bool,
    order_updates: bool,
    batch_size: usize,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group deferred inserts by entity type (dependencies still first).
    #[must_use]
    pub fn with_order_inserts(mut self, value: bool) -> Self {
        self.order_inserts = value;
        self
    }

    /// Sort updates by entity name and identifier.
    #[must_use]
    pub fn with_order_updates(mut self, value: bool) -> Self {
        self.order_updates = value;
        self
    }

    /// Largest run of consecutive same-target actions reported as one batch.
    /// 0 leaves runs unbounded.
    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    fn list(&self, phase: Phase) -> &Vec<Action> {
        match phase {
            Phase::Insertion => &self.insertions,
            Phase::Update => &self.updates,
            Phase::CollectionRemoval => &self.collection_removals,
            Phase::CollectionUpdate => &self.collection_updates,
            Phase::CollectionRecreation => &self.collection_creations,
            Phase::Deletion => &self.deletions,
        }
    }

    fn list_mut(&mut self, phase: Phase) -> &mut Vec<Action> {
        match phase {
            Phase::Insertion => &mut self.insertions,
            Phase::Update => &mut self.updates,
            Phase::CollectionRemoval => &mut self.collection_removals,
            Phase::CollectionUpdate => &mut self.collection_updates,
            Phase::CollectionRecreation => &mut self.collection_creations,
            Phase::Deletion => &mut self.deletions,
        }
    }

    /// Queue an action in its phase list.
    pub fn enqueue(&mut self, action: Action) {
        tracing::trace!(action = %action, "Queued action");
        let phase = action.phase();
        self.list_mut(phase).push(action);
    }

    /// Run an insert now, after every deferred insert queued before it.
    ///
    /// Used for store-generated identifiers, which are only known once the
    /// row exists.
    pub fn execute_immediate(
        &mut self,
        action: Action,
        conn: &mut dyn Connection,
        ctx: &mut PersistenceContext,
    ) -> Result<()> {
        self.check_usable()?;
        self.execute_inserts(conn, ctx)?;
        match action.execute(conn, ctx) {
            Ok(completion) => {
                self.completions.push(completion);
                Ok(())
            }
            Err(e) => {
                self.poisoned = true;
                Err(e)
            }
        }
    }

    /// Run only the insertion phase.
    pub fn execute_inserts(&mut self, conn: &mut dyn Connection, ctx: &mut PersistenceContext) -> Result<usize> {
        self.check_usable()?;
        self.sort_phase(Phase::Insertion);
        self.execute_phase(Phase::Insertion, conn, ctx)
    }

    /// Run every queued action, phase by phase.
    #[tracing::instrument(level = "debug", skip(self, conn, ctx))]
    pub fn execute(&mut self, conn: &mut dyn Connection, ctx: &mut PersistenceContext) -> Result<FlushStats> {
        self.check_usable()?;
        for phase in Phase::ALL {
            self.sort_phase(phase);
        }

        let mut stats = FlushStats::default();
        for phase in Phase::ALL {
            let count = self.execute_phase(phase, conn, ctx)?;
            stats.record(phase, count);
        }
        Ok(stats)
    }

    fn check_usable(&self) -> Result<()> {
        if self.poisoned {
            return Err(Error::usage(
                UsageErrorKind::QueueUnusable,
                "action queue failed during an earlier flush and cannot be executed again",
            ));
        }
        Ok(())
    }

    fn sort_phase(&mut self, phase: Phase) {
        match phase {
            Phase::Insertion => {
                let actions = std::mem::take(&mut self.insertions);
                self.insertions = order_by_references(actions, false, self.order_inserts);
            }
            Phase::Deletion => {
                let actions = std::mem::take(&mut self.deletions);
                self.deletions = order_by_references(actions, true, false);
            }
            Phase::Update if self.order_updates => {
                self.updates.sort_by(compare_by_key);
            }
            _ => {}
        }
    }

    fn execute_phase(
        &mut self,
        phase: Phase,
        conn: &mut dyn Connection,
        ctx: &mut PersistenceContext,
    ) -> Result<usize> {
        let actions = std::mem::take(self.list_mut(phase));
        if actions.is_empty() {
            return Ok(0);
        }
        for (target, count) in batches(&actions, self.batch_size) {
            tracing::debug!(phase = ?phase, target = %target, count, "Executing batch");
        }

        let mut executed = 0;
        let mut remaining = actions.into_iter();
        while let Some(action) = remaining.next() {
            match action.execute(conn, ctx) {
                Ok(completion) => {
                    self.completions.push(completion);
                    executed += 1;
                }
                Err(e) => {
                    tracing::warn!(action = %action, error = %e, "Action failed; queue is now unusable");
                    self.poisoned = true;
                    let list = self.list_mut(phase);
                    list.push(action);
                    list.extend(remaining);
                    return Err(e);
                }
            }
        }
        Ok(executed)
    }

    // ------------------------------------------------------------------
    // Queries over pending work
    // ------------------------------------------------------------------

    pub fn has_any_queued_actions(&self) -> bool {
        Phase::ALL.iter().any(|&p| !self.list(p).is_empty())
    }

    /// Rows would appear or disappear: inserts, deletes, collection
    /// removals or recreations are pending.
    pub fn has_pending_structural_changes(&self) -> bool {
        !self.insertions.is_empty()
            || !self.deletions.is_empty()
            || !self.collection_removals.is_empty()
            || !self.collection_creations.is_empty()
    }

    /// Whether any pending action writes one of `spaces`.
    pub fn are_tables_to_be_updated(&self, spaces: &BTreeSet<String>) -> bool {
        Phase::ALL.iter().any(|&p| {
            self.list(p)
                .iter()
                .any(|a| a.query_spaces().iter().any(|s| spaces.contains(s)))
        })
    }

    /// Drop the actions produced by a dirty check that did not lead to a
    /// flush. Inserts and deletes stay, they came from explicit calls.
    pub fn clear_from_flush_needed_check(&mut self, previous_collection_removals: usize) {
        self.updates.clear();
        self.collection_updates.clear();
        self.collection_creations.clear();
        self.collection_removals
            .truncate(previous_collection_removals);
    }

    /// Remove the pending delete of `entity`, returning it.
    pub fn unschedule_deletion(&mut self, entity: &EntityRef) -> Option<Action> {
        let pos = self
            .deletions
            .iter()
            .position(|a| a.entity().is_some_and(|e| e.ptr_eq(entity)))?;
        Some(self.deletions.remove(pos))
    }

    /// Pending insert of `entity`, if it has not run yet.
    pub fn has_pending_insert(&self, entity: &EntityRef) -> bool {
        self.insertions
            .iter()
            .any(|a| a.entity().is_some_and(|e| e.ptr_eq(entity)))
    }

    pub fn count(&self, phase: Phase) -> usize {
        self.list(phase).len()
    }

    pub fn len(&self) -> usize {
        Phase::ALL.iter().map(|&p| self.list(p).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_any_queued_actions()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Actions of one phase, in queue order.
    pub fn actions(&self, phase: Phase) -> &[Action] {
        self.list(phase)
    }

    /// Register extra completion work (bulk statements).
    pub fn register_completion(&mut self, completion: Completion) {
        self.completions.push(completion);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Close out the transaction. On success, evict written entities from
    /// their cache regions and return the query spaces to invalidate. On
    /// failure the completions are dropped. Unexecuted actions are
    /// discarded either way.
    pub fn after_transaction_completion(
        &mut self,
        success: bool,
        caches: &dyn Fn(&str) -> Option<Arc<dyn CacheRegion>>,
    ) -> BTreeSet<String> {
        let completions = std::mem::take(&mut self.completions);
        let discarded = self.len();
        if discarded > 0 {
            tracing::debug!(discarded, "Discarding unexecuted actions at transaction end");
        }
        self.clear_actions();
        self.poisoned = false;

        let mut spaces = BTreeSet::new();
        if !success {
            return spaces;
        }
        for completion in completions {
            if let Some((region, key)) = completion.evict {
                if let Some(region) = caches(&region) {
                    region.evict(&key);
                }
            }
            spaces.extend(completion.spaces);
        }
        spaces
    }

    fn clear_actions(&mut self) {
        for phase in Phase::ALL {
            self.list_mut(phase).clear();
        }
    }

    pub fn clear(&mut self) {
        self.clear_actions();
        self.completions.clear();
        self.poisoned = false;
    }

    /// Drop unexecuted actions but keep the completions of executed ones,
    /// which still have to run when the transaction ends.
    pub fn discard_pending(&mut self) {
        let discarded = self.len();
        if discarded > 0 {
            tracing::debug!(discarded, "Discarding unexecuted actions");
        }
        self.clear_actions();
    }

    /// Deep copy of the pending actions through `copier`.
    pub fn snapshot_with(&self, copier: &GraphCopier) -> QueueSnapshot {
        let copy = |list: &Vec<Action>| list.iter().map(|a| a.copy_with(copier)).collect();
        QueueSnapshot {
            insertions: copy(&self.insertions),
            updates: copy(&self.updates),
            collection_removals: copy(&self.collection_removals),
            collection_updates: copy(&self.collection_updates),
            collection_creations: copy(&self.collection_creations),
            deletions: copy(&self.deletions),
        }
    }

    /// Install a snapshot. The queue must be empty.
    pub fn restore(&mut self, snapshot: QueueSnapshot) -> Result<()> {
        if self.has_any_queued_actions() {
            return Err(Error::usage(
                UsageErrorKind::Unsupported,
                "cannot restore a snapshot into a non-empty action queue",
            ));
        }
        self.insertions = snapshot.insertions;
        self.updates = snapshot.updates;
        self.collection_removals = snapshot.collection_removals;
        self.collection_updates = snapshot.collection_updates;
        self.collection_creations = snapshot.collection_creations;
        self.deletions = snapshot.deletions;
        Ok(())
    }
}

/// Detached copy of an [`ActionQueue`]'s pending actions.
#[derive(Debug)]
pub struct QueueSnapshot {
    insertions: Vec<Action>,
    updates: Vec<Action>,
    collection_removals: Vec<Action>,
    collection_updates: Vec<Action>,
    collection_creations: Vec<Action>,
    deletions: Vec<Action>,
}

impl QueueSnapshot {
    pub fn len(&self) -> usize {
        self.insertions.len()
            + self.updates.len()
            + self.collection_removals.len()
            + self.collection_updates.len()
            + self.collection_creations.len()
            + self.deletions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Ordering
// ============================================================================

/// Entities `entity` references through in-memory association targets.
fn referenced(entity: &EntityRef) -> Vec<EntityIdentity> {
    let entity = entity.read();
    entity
        .properties()
        .filter_map(|(_, prop)| match prop {
            Property::Reference(assoc) => assoc.target().map(EntityRef::identity),
            _ => None,
        })
        .collect()
}

/// Stable topological order over entity references.
///
/// With `reverse == false` a referenced entity's action comes first
/// (inserts); with `reverse == true` the referencing entity's action comes
/// first (deletes). Otherwise queue order is kept. Cycles fall back to queue
/// order for the entities involved.
///
/// `group_by_type` then gathers actions of the same entity type together
/// without moving any action ahead of its dependencies.
fn order_by_references(actions: Vec<Action>, reverse: bool, group_by_type: bool) -> Vec<Action> {
    let n = actions.len();
    if n < 2 {
        return actions;
    }

    let index: HashMap<EntityIdentity, usize> = actions
        .iter()
        .enumerate()
        .filter_map(|(i, a)| a.entity().map(|e| (e.identity(), i)))
        .collect();

    // deps[i]: actions that must run before action i.
    let mut deps: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, action) in actions.iter().enumerate() {
        let Some(entity) = action.entity() else {
            continue;
        };
        for target in referenced(entity) {
            let Some(&j) = index.get(&target) else {
                continue;
            };
            if i == j {
                continue;
            }
            if reverse {
                deps[j].push(i);
            } else {
                deps[i].push(j);
            }
        }
    }

    // Kahn's algorithm; the ready set yields the lowest queue index first.
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut pending = vec![0usize; n];
    for (i, d) in deps.iter_mut().enumerate() {
        d.sort_unstable();
        d.dedup();
        pending[i] = d.len();
        for &j in d.iter() {
            dependents[j].push(i);
        }
    }
    let mut ready: BinaryHeap<Reverse<usize>> = (0..n).filter(|&i| pending[i] == 0).map(Reverse).collect();

    let mut placed = vec![false; n];
    let mut level = vec![0usize; n];
    let mut order = Vec::with_capacity(n);
    let mut scan = 0usize;
    while order.len() < n {
        let i = match ready.pop() {
            Some(Reverse(i)) if placed[i] => continue,
            Some(Reverse(i)) => i,
            None => {
                while scan < n && placed[scan] {
                    scan += 1;
                }
                if scan == n {
                    break;
                }
                tracing::warn!(
                    action = %actions[scan],
                    "Reference cycle among queued actions; keeping queue order"
                );
                scan
            }
        };
        placed[i] = true;
        level[i] = deps[i]
            .iter()
            .filter(|&&d| placed[d])
            .map(|&d| level[d] + 1)
            .max()
            .unwrap_or(0);
        order.push(i);
        for &k in &dependents[i] {
            pending[k] = pending[k].saturating_sub(1);
            if pending[k] == 0 && !placed[k] {
                ready.push(Reverse(k));
            }
        }
    }

    if group_by_type {
        let mut first_seen: HashMap<String, usize> = HashMap::new();
        for (i, action) in actions.iter().enumerate() {
            first_seen.entry(action.target_name()).or_insert(i);
        }
        let rank = |i: usize| first_seen.get(&actions[i].target_name()).copied().unwrap_or(i);
        // Stable: ties keep topological order.
        order.sort_by_key(|&i| (level[i], rank(i)));
    }

    let mut slots: Vec<Option<Action>> = actions.into_iter().map(Some).collect();
    order.into_iter().filter_map(|i| slots[i].take()).collect()
}

fn update_key(action: &Action) -> (String, Option<Value>) {
    match action {
        Action::EntityUpdate(a) => (a.persister.entity_name().to_string(), Some(a.id.clone())),
        other => (other.target_name(), None),
    }
}

fn compare_by_key(a: &Action, b: &Action) -> Ordering {
    let (name_a, id_a) = update_key(a);
    let (name_b, id_b) = update_key(b);
    name_a.cmp(&name_b).then_with(|| match (id_a, id_b) {
        (Some(x), Some(y)) => compare_values(&x, &y),
        _ => Ordering::Equal,
    })
}

/// Total order over identifier values: numbers numerically, text
/// lexicographically, mixed kinds by type name.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x.cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.total_cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return x.cmp(y);
    }
    a.type_name()
        .cmp(b.type_name())
        .then_with(|| a.to_string().cmp(&b.to_string()))
}

/// Runs of consecutive actions with the same target, split at `batch_size`.
fn batches(actions: &[Action], batch_size: usize) -> Vec<(String, usize)> {
    let mut out: Vec<(String, usize)> = Vec::new();
    for action in actions {
        let target = action.target_name();
        match out.last_mut() {
            Some((last, count)) if *last == target && (batch_size == 0 || *count < batch_size) => {
                *count += 1;
            }
            _ => out.push((target, 1)),
        }
    }
    out
}
