// Copyright 2025 The Weft Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Distributed object reference counting.
//!
//! Every worker process holds one [`ReferenceCounter`]. It tracks, per
//! object: local language-level references, references held by submitted
//! tasks, remote workers currently borrowing the object, the objects it is
//! nested inside, lineage pins for task re-execution, and where the object's
//! value lives (primary copy, replicas, spill location).
//!
//! The owner of an object keeps the object's value alive until every remote
//! borrower has confirmed — over the ref-removed pub/sub channel — that it
//! has stopped borrowing. Borrowers accumulate the sub-borrowers they created
//! and report them back when they finish, so the owner's borrower set is
//! eventually complete even though messages arrive out of order.
//!
//! All state lives behind a single mutex. Publishing and subscribing are
//! fire-and-forget on the injected interfaces, so no method ever blocks on
//! I/O while the lock is held.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, LazyLock, Weak};

use parking_lot::Mutex;

use weft_common::address::WorkerAddress;
use weft_common::config::weft_config;
use weft_common::constants::OBJECT_SIZE_UNKNOWN;
use weft_common::id::{NodeID, ObjectID};
use weft_proto::{
    pub_message, sub_message, ChannelType, CoreWorkerStats, ObjectRefInfo, ObjectReference,
    ObjectReferenceCount, PubMessage, SubMessage, TensorTransport, WorkerObjectLocationsMessage,
    WorkerRefRemovedMessage, WorkerRefRemovedSubMessage,
};
use weft_pubsub::{
    MessagePublishedCallback, PublisherFailedCallback, PublisherInterface, SubscriberInterface,
};
use weft_util::warn_every_ms;

/// Invoked when an object's lineage is released. Receives the object id and
/// fills `arg_ids` with the ids of the task arguments whose lineage pins must
/// be dropped in turn. Returns the number of lineage bytes reclaimed.
///
/// Runs while the counter's lock is held; it must not call back into the
/// counter.
pub type LineageReleasedCallback =
    Box<dyn Fn(&ObjectID, &mut Vec<ObjectID>) -> i64 + Send + Sync>;

/// Probe for whether a node is still alive.
pub type NodeLivenessProbe = Box<dyn Fn(&NodeID) -> bool + Send + Sync>;

/// A one-shot per-object callback. Runs while the counter's lock is held; it
/// must not call back into the counter.
pub type ObjectCallback = Box<dyn FnOnce(&ObjectID) + Send>;

/// Locality information for an object: its size and the nodes known to hold
/// a copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalityData {
    pub object_size: u64,
    pub nodes: HashSet<NodeID>,
}

// ─── Per-object record ──────────────────────────────────────────────────────

/// Containment edges. Allocated lazily: most objects never nest.
#[derive(Debug, Default)]
struct NestedRefs {
    /// Object ids nested inside this object's value.
    contains: HashSet<ObjectID>,
    /// Owned outer ids whose values contain this object.
    contained_in_owned: HashSet<ObjectID>,
    /// Borrowed outer ids whose values contain this object.
    contained_in_borrowed_ids: HashSet<ObjectID>,
}

/// Borrow bookkeeping. Allocated lazily: most objects are never borrowed.
#[derive(Debug, Default)]
struct BorrowInfo {
    /// Workers currently borrowing this object. Owner-side state; an entry
    /// is removed once the borrower's ref-removed reply has been merged.
    borrowers: HashSet<WorkerAddress>,
    /// Outer objects this id was serialized into that we do not own, with the
    /// outer objects' owners. Reported back to this object's owner.
    stored_in_objects: HashMap<ObjectID, WorkerAddress>,
}

static EMPTY_NESTED: LazyLock<NestedRefs> = LazyLock::new(NestedRefs::default);
static EMPTY_BORROW: LazyLock<BorrowInfo> = LazyLock::new(BorrowInfo::default);

/// Ownership and reference state for a single object.
struct Reference {
    /// The worker that owns this object. Absent until provenance is known
    /// (a deserialized id may be seen before its owner is reported).
    owner_address: Option<WorkerAddress>,
    /// Whether this process is the owner.
    owned_by_us: bool,

    /// Description of the call that created the reference.
    call_site: String,
    /// Object size in bytes, or -1 if unknown.
    object_size: i64,
    /// Whether the object can be rebuilt by re-executing its creating task.
    is_reconstructable: bool,
    /// The task that creates this object has been submitted but its value has
    /// not been reported yet.
    pending_creation: bool,
    /// The object's lineage was evicted while the object was still in scope;
    /// reconstruction attempts must fail cleanly.
    lineage_evicted: bool,

    local_ref_count: usize,
    submitted_task_ref_count: usize,
    /// Tasks that may be re-executed and would need this object as an
    /// argument. Does not keep the value pinned, only the Reference.
    lineage_ref_count: usize,

    nested: Option<Box<NestedRefs>>,
    borrow: Option<Box<BorrowInfo>>,

    /// Some reference nested inside this borrowed object is in use, so this
    /// object must be reported to its owner even if we never unwrapped it.
    has_nested_refs_to_report: bool,
    /// A foreign owner already monitors this borrow; do not report it again
    /// through the regular task-finish path.
    foreign_owner_already_monitoring: bool,
    /// The owner asked us to report back once we stop borrowing this object.
    /// While set, the Reference must not be erased.
    ref_removed_reply_pending: bool,

    on_object_out_of_scope_or_freed_callbacks: Vec<ObjectCallback>,
    on_object_ref_delete: Option<ObjectCallback>,

    /// Node holding the primary in-memory copy. Owner-side state.
    pinned_at_raylet_id: Option<NodeID>,
    spilled: bool,
    /// The object was spilled at some point, even if the spilled copy is gone.
    did_spill: bool,
    spilled_url: String,
    spilled_node_id: NodeID,
    /// All nodes known to hold a copy.
    locations: HashSet<NodeID>,

    /// Transport tag for the object's payload. Recorded, not interpreted.
    tensor_transport: TensorTransport,
}

impl Default for Reference {
    fn default() -> Self {
        Self {
            owner_address: None,
            owned_by_us: false,
            call_site: String::new(),
            object_size: OBJECT_SIZE_UNKNOWN,
            is_reconstructable: false,
            pending_creation: false,
            lineage_evicted: false,
            local_ref_count: 0,
            submitted_task_ref_count: 0,
            lineage_ref_count: 0,
            nested: None,
            borrow: None,
            has_nested_refs_to_report: false,
            foreign_owner_already_monitoring: false,
            ref_removed_reply_pending: false,
            on_object_out_of_scope_or_freed_callbacks: Vec::new(),
            on_object_ref_delete: None,
            pinned_at_raylet_id: None,
            spilled: false,
            did_spill: false,
            spilled_url: String::new(),
            spilled_node_id: NodeID::nil(),
            locations: HashSet::new(),
            tensor_transport: TensorTransport::ObjectStore,
        }
    }
}

impl Reference {
    fn with_call_site(call_site: &str, object_size: i64) -> Self {
        Self {
            call_site: call_site.to_string(),
            object_size,
            ..Default::default()
        }
    }

    fn owned(
        owner_address: WorkerAddress,
        call_site: &str,
        object_size: i64,
        is_reconstructable: bool,
        pinned_at_raylet_id: Option<NodeID>,
        tensor_transport: TensorTransport,
    ) -> Self {
        Self {
            owner_address: Some(owner_address),
            owned_by_us: true,
            call_site: call_site.to_string(),
            object_size,
            is_reconstructable,
            pinned_at_raylet_id,
            tensor_transport,
            ..Default::default()
        }
    }

    fn nested(&self) -> &NestedRefs {
        self.nested.as_deref().unwrap_or(&EMPTY_NESTED)
    }

    fn mutable_nested(&mut self) -> &mut NestedRefs {
        self.nested.get_or_insert_with(Default::default)
    }

    fn borrow_info(&self) -> &BorrowInfo {
        self.borrow.as_deref().unwrap_or(&EMPTY_BORROW)
    }

    fn mutable_borrow_info(&mut self) -> &mut BorrowInfo {
        self.borrow.get_or_insert_with(Default::default)
    }

    /// Everything that keeps the object's value reachable from somewhere.
    fn ref_count(&self) -> usize {
        self.local_ref_count
            + self.submitted_task_ref_count
            + self.borrow_info().borrowers.len()
            + self.borrow_info().stored_in_objects.len()
            + self.nested().contained_in_owned.len()
            + self.nested().contained_in_borrowed_ids.len()
    }

    /// The object's value is unreachable. Lineage pins do not count: they keep
    /// the Reference, not the value.
    fn out_of_scope(&self) -> bool {
        self.ref_count() == 0
    }

    /// The Reference itself may be erased from the table.
    fn should_delete(&self, lineage_pinning_enabled: bool) -> bool {
        self.out_of_scope()
            && (!lineage_pinning_enabled || self.lineage_ref_count == 0)
            && !self.ref_removed_reply_pending
    }

    fn from_proto(proto: &ObjectReferenceCount) -> Self {
        let mut reference = Reference::default();
        reference.owner_address = proto
            .reference
            .as_ref()
            .and_then(|r| r.owner_address.as_ref())
            .map(WorkerAddress::from_proto);
        reference.local_ref_count = usize::from(proto.has_local_ref);
        for borrower in &proto.borrowers {
            reference
                .mutable_borrow_info()
                .borrowers
                .insert(WorkerAddress::from_proto(borrower));
        }
        for stored in &proto.stored_in_objects {
            let object_id = ObjectID::from_binary(&stored.object_id);
            let owner = stored
                .owner_address
                .as_ref()
                .map(WorkerAddress::from_proto)
                .expect("stored_in_objects entry is missing its owner address");
            reference
                .mutable_borrow_info()
                .stored_in_objects
                .insert(object_id, owner);
        }
        for id in &proto.contains {
            reference
                .mutable_nested()
                .contains
                .insert(ObjectID::from_binary(id));
        }
        for id in &proto.contained_in_borrowed_ids {
            reference
                .mutable_nested()
                .contained_in_borrowed_ids
                .insert(ObjectID::from_binary(id));
        }
        reference
    }

    /// Serialize for reporting to the owner. With `deduct_local_ref`, the
    /// artificial local ref added for the duration of a task execution is not
    /// counted, so the owner sees the true post-task state.
    fn to_proto(&self, deduct_local_ref: bool) -> ObjectReferenceCount {
        let mut proto = ObjectReferenceCount {
            reference: Some(ObjectReference {
                object_id: Vec::new(),
                owner_address: self.owner_address.as_ref().map(|a| a.to_proto()),
            }),
            has_local_ref: self.ref_count() > usize::from(deduct_local_ref),
            ..Default::default()
        };
        for borrower in &self.borrow_info().borrowers {
            proto.borrowers.push(borrower.to_proto());
        }
        for (object_id, owner) in &self.borrow_info().stored_in_objects {
            proto.stored_in_objects.push(ObjectReference {
                object_id: object_id.binary(),
                owner_address: Some(owner.to_proto()),
            });
        }
        for id in &self.nested().contained_in_borrowed_ids {
            proto.contained_in_borrowed_ids.push(id.binary());
        }
        for id in &self.nested().contains {
            proto.contains.push(id.binary());
        }
        proto
    }

    fn debug_string(&self) -> String {
        format!(
            "Reference{{borrowers: {} local_ref_count: {} submitted_count: {} \
             contained_in_owned: {} contained_in_borrowed: {} contains: {} \
             stored_in: {} lineage_ref_count: {}}}",
            self.borrow_info().borrowers.len(),
            self.local_ref_count,
            self.submitted_task_ref_count,
            self.nested().contained_in_owned.len(),
            self.nested().contained_in_borrowed_ids.len(),
            self.nested().contains.len(),
            self.borrow_info().stored_in_objects.len(),
            self.lineage_ref_count,
        )
    }
}

// ─── Serialized sub-tables ──────────────────────────────────────────────────

/// Deserialize a reference sub-table received from another worker.
fn reference_table_from_proto(protos: &[ObjectReferenceCount]) -> HashMap<ObjectID, Reference> {
    let mut refs = HashMap::with_capacity(protos.len());
    for proto in protos {
        let object_id = proto
            .reference
            .as_ref()
            .map(|r| ObjectID::from_binary(&r.object_id))
            .expect("reference table entry is missing its object id");
        refs.insert(object_id, Reference::from_proto(proto));
    }
    refs
}

/// Serialize a sub-table, stamping each entry with its object id.
fn reference_table_to_proto(
    table: HashMap<ObjectID, ObjectReferenceCount>,
) -> Vec<ObjectReferenceCount> {
    table
        .into_iter()
        .map(|(object_id, mut proto)| {
            proto
                .reference
                .get_or_insert_with(Default::default)
                .object_id = object_id.binary();
            proto
        })
        .collect()
}

// ─── Table state ────────────────────────────────────────────────────────────

/// Everything guarded by the counter's mutex.
#[derive(Default)]
struct ReferenceTable {
    object_id_refs: HashMap<ObjectID, Reference>,

    /// Objects whose plasma value was explicitly freed. The Reference stays
    /// in the table so ownership information survives; membership here means
    /// the value must not be recreated implicitly.
    freed_objects: HashSet<ObjectID>,

    /// FIFO of owned objects whose lineage may be evicted, oldest first.
    /// Entries are removed lazily: the mirror index below is authoritative,
    /// and stale queue entries are skipped during eviction.
    reconstructable_owned_objects: VecDeque<ObjectID>,
    reconstructable_owned_objects_index: HashSet<ObjectID>,

    /// Objects whose primary copy was lost and that should be rebuilt.
    /// Drained by `flush_objects_to_recover`.
    objects_to_recover: Vec<ObjectID>,

    num_objects_owned_by_us: usize,
    num_actors_owned_by_us: usize,

    on_lineage_released: Option<LineageReleasedCallback>,
    shutdown_hook: Option<Box<dyn FnOnce() + Send>>,
}

// ─── The counter ────────────────────────────────────────────────────────────

/// Worker-local authority over which objects are still reachable.
///
/// Construct with [`ReferenceCounter::new`]; the counter hands a weak
/// reference to itself to every subscription callback, which is why
/// construction returns an `Arc`.
pub struct ReferenceCounter {
    /// This process's own address. An object whose owner address equals this
    /// is owned by us.
    rpc_address: WorkerAddress,
    publisher: Arc<dyn PublisherInterface>,
    subscriber: Arc<dyn SubscriberInterface>,
    check_node_alive: NodeLivenessProbe,
    lineage_pinning_enabled: bool,
    state: Mutex<ReferenceTable>,
    weak_self: Weak<ReferenceCounter>,
}

impl ReferenceCounter {
    pub fn new(
        rpc_address: WorkerAddress,
        publisher: Arc<dyn PublisherInterface>,
        subscriber: Arc<dyn SubscriberInterface>,
        check_node_alive: NodeLivenessProbe,
        lineage_pinning_enabled: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            rpc_address,
            publisher,
            subscriber,
            check_node_alive,
            lineage_pinning_enabled,
            state: Mutex::new(ReferenceTable::default()),
            weak_self: weak_self.clone(),
        })
    }

    // ─── Local references ───────────────────────────────────────────────

    /// Add a language-level reference. Creates the entry if the id is new; in
    /// that case the owner must be supplied later via `add_borrowed_object`.
    pub fn add_local_reference(&self, object_id: ObjectID, call_site: &str) {
        if object_id.is_nil() {
            return;
        }
        let mut state = self.state.lock();
        let reference = state
            .object_id_refs
            .entry(object_id)
            .or_insert_with(|| Reference::with_call_site(call_site, OBJECT_SIZE_UNKNOWN));
        let was_in_use = reference.ref_count() > 0;
        reference.local_ref_count += 1;
        tracing::debug!("Add local reference {}", object_id);
        let in_use = reference.ref_count() > 0;
        if !was_in_use && in_use {
            self.set_nested_ref_in_use_recursive(&mut state, &object_id);
        }
    }

    /// Remove a language-level reference. Returns the ids whose values became
    /// unreachable as a result (the removed id and any cascaded inner ids).
    pub fn remove_local_reference(&self, object_id: &ObjectID) -> Vec<ObjectID> {
        let mut deleted = Vec::new();
        if object_id.is_nil() {
            return deleted;
        }
        let mut state = self.state.lock();
        self.remove_local_reference_internal(&mut state, object_id, &mut deleted);
        deleted
    }

    fn remove_local_reference_internal(
        &self,
        state: &mut ReferenceTable,
        object_id: &ObjectID,
        deleted: &mut Vec<ObjectID>,
    ) {
        assert!(!object_id.is_nil());
        let ref_count_zero = {
            let Some(reference) = state.object_id_refs.get_mut(object_id) else {
                warn_every_ms!(
                    weft_config().race_warning_interval_ms,
                    "Tried to decrease ref count for nonexistent object ID: {}",
                    object_id
                );
                return;
            };
            if reference.local_ref_count == 0 {
                warn_every_ms!(
                    weft_config().race_warning_interval_ms,
                    "Tried to decrease ref count for object ID that has count 0: {}. \
                     This should only happen if the object was explicitly freed earlier.",
                    object_id
                );
                return;
            }
            reference.local_ref_count -= 1;
            tracing::debug!("Remove local reference {}", object_id);
            reference.ref_count() == 0
        };
        if ref_count_zero {
            self.delete_reference_internal(state, object_id, deleted);
        }
    }

    /// Drop every local reference in the table. Teardown/test aid.
    pub fn release_all_local_references(&self) {
        let mut state = self.state.lock();
        let mut refs_to_remove = Vec::new();
        for (object_id, reference) in &state.object_id_refs {
            for _ in 0..reference.local_ref_count {
                refs_to_remove.push(*object_id);
            }
        }
        let mut deleted = Vec::new();
        for object_id in refs_to_remove {
            self.remove_local_reference_internal(&mut state, &object_id, &mut deleted);
        }
    }

    /// Best-effort release of one local reference per id. Used for generator
    /// returns that were never consumed; absent or zero-count ids are skipped.
    pub fn try_release_local_refs(&self, object_ids: &[ObjectID]) -> Vec<ObjectID> {
        let mut state = self.state.lock();
        let mut deleted = Vec::new();
        for object_id in object_ids {
            let has_local_ref = state
                .object_id_refs
                .get(object_id)
                .map(|r| r.local_ref_count > 0)
                .unwrap_or(false);
            if has_local_ref {
                self.remove_local_reference_internal(&mut state, object_id, &mut deleted);
            }
        }
        deleted
    }

    // ─── Owned objects ──────────────────────────────────────────────────

    /// Register an object created by this process. Panics if the id is
    /// already in the table: owning the same id twice is a bug.
    #[allow(clippy::too_many_arguments)]
    pub fn add_owned_object(
        &self,
        object_id: ObjectID,
        inner_ids: &[ObjectID],
        owner_address: WorkerAddress,
        call_site: &str,
        object_size: i64,
        is_reconstructable: bool,
        add_local_ref: bool,
        pinned_at_raylet_id: Option<NodeID>,
        tensor_transport: TensorTransport,
    ) {
        let mut state = self.state.lock();
        assert!(
            self.add_owned_object_internal(
                &mut state,
                &object_id,
                inner_ids,
                owner_address,
                call_site,
                object_size,
                is_reconstructable,
                add_local_ref,
                pinned_at_raylet_id,
                tensor_transport,
            ),
            "Tried to create an owned object that already exists: {}",
            object_id
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn add_owned_object_internal(
        &self,
        state: &mut ReferenceTable,
        object_id: &ObjectID,
        inner_ids: &[ObjectID],
        owner_address: WorkerAddress,
        call_site: &str,
        object_size: i64,
        is_reconstructable: bool,
        add_local_ref: bool,
        pinned_at_raylet_id: Option<NodeID>,
        tensor_transport: TensorTransport,
    ) -> bool {
        if state.object_id_refs.contains_key(object_id) {
            return false;
        }
        if object_id.is_actor_id() {
            state.num_actors_owned_by_us += 1;
        } else {
            state.num_objects_owned_by_us += 1;
        }
        tracing::debug!("Adding owned object {}", object_id);
        // The new entry starts with a direct count of zero: for a submitted
        // task, the return ObjectID is created in the frontend language, which
        // adds the local reference itself.
        state.object_id_refs.insert(
            *object_id,
            Reference::owned(
                owner_address,
                call_site,
                object_size,
                is_reconstructable,
                pinned_at_raylet_id,
                tensor_transport,
            ),
        );
        if !inner_ids.is_empty() {
            // The inner objects must not be reclaimed until this outer object
            // goes out of scope.
            let rpc_address = self.rpc_address.clone();
            self.add_nested_object_ids_internal(state, object_id, inner_ids, &rpc_address);
        }
        if let Some(node_id) = pinned_at_raylet_id {
            // Eagerly record the pinned location instead of waiting for the
            // store notification.
            self.add_object_location_internal(state, object_id, node_id);
        }

        state.reconstructable_owned_objects.push_back(*object_id);
        assert!(
            state.reconstructable_owned_objects_index.insert(*object_id),
            "object {} already queued for lineage eviction",
            object_id
        );

        if add_local_ref {
            state
                .object_id_refs
                .get_mut(object_id)
                .expect("just inserted")
                .local_ref_count += 1;
        }
        true
    }

    /// Register a return object of a generator task, tying its liveness to
    /// the generator object. No-op if the generator already went out of
    /// scope — then the inner object was either never deserialized or already
    /// registered.
    pub fn add_dynamic_return(&self, object_id: ObjectID, generator_id: &ObjectID) {
        let mut state = self.state.lock();
        let Some(generator) = state.object_id_refs.get(generator_id) else {
            return;
        };
        assert!(generator.owned_by_us);
        let owner_address = generator
            .owner_address
            .clone()
            .expect("owned reference is missing its owner address");
        let call_site = generator.call_site.clone();
        let is_reconstructable = generator.is_reconstructable;
        tracing::debug!(
            "Adding dynamic return {} contained in generator object {}",
            object_id,
            generator_id
        );
        let _ = self.add_owned_object_internal(
            &mut state,
            &object_id,
            &[],
            owner_address.clone(),
            &call_site,
            OBJECT_SIZE_UNKNOWN,
            is_reconstructable,
            /*add_local_ref=*/ false,
            None,
            TensorTransport::ObjectStore,
        );
        self.add_nested_object_ids_internal(&mut state, generator_id, &[object_id], &owner_address);
    }

    /// Register a streamed generator return and take a local reference to it.
    /// The stream layer releases the reference when the item is consumed or
    /// the stream is deleted. No-op if the generator already went out of
    /// scope.
    pub fn own_dynamic_streaming_task_return_ref(
        &self,
        object_id: ObjectID,
        generator_id: &ObjectID,
    ) {
        let mut state = self.state.lock();
        let Some(generator) = state.object_id_refs.get(generator_id) else {
            tracing::debug!(
                "Ignoring dynamic streaming return {} registered after generator {} \
                 went out of scope",
                object_id,
                generator_id
            );
            return;
        };
        assert!(generator.owned_by_us);
        let owner_address = generator
            .owner_address
            .clone()
            .expect("owned reference is missing its owner address");
        let call_site = generator.call_site.clone();
        let is_reconstructable = generator.is_reconstructable;
        tracing::debug!(
            "Adding dynamic return {} contained in generator object {}",
            object_id,
            generator_id
        );
        let _ = self.add_owned_object_internal(
            &mut state,
            &object_id,
            &[],
            owner_address,
            &call_site,
            OBJECT_SIZE_UNKNOWN,
            is_reconstructable,
            /*add_local_ref=*/ true,
            None,
            TensorTransport::ObjectStore,
        );
    }

    /// True iff the generator object and its first `num_objects_generated`
    /// return objects are all gone from the table.
    pub fn check_generator_refs_lineage_out_of_scope(
        &self,
        generator_id: &ObjectID,
        num_objects_generated: i64,
    ) -> bool {
        let state = self.state.lock();
        if state.object_id_refs.contains_key(generator_id) {
            return false;
        }
        let task_id = generator_id.task_id();
        for i in 0..num_objects_generated {
            // Task returns start from index 1 and the first return object is
            // the generator itself, so generated objects start at index 2.
            let return_id = ObjectID::from_index(&task_id, (i + 2) as u32);
            if state.object_id_refs.contains_key(&return_id) {
                return false;
            }
        }
        true
    }

    /// Record a late-arriving object size and notify location subscribers.
    pub fn update_object_size(&self, object_id: &ObjectID, object_size: i64) {
        let mut state = self.state.lock();
        if let Some(reference) = state.object_id_refs.get_mut(object_id) {
            reference.object_size = object_size;
            self.push_to_location_subscribers(&state, object_id);
        }
    }

    // ─── Task submission ────────────────────────────────────────────────

    /// Account for a newly submitted task: its return ids become pending and
    /// each by-reference argument gains a submitted-task pin (plus a lineage
    /// pin). Arguments whose values were inlined after submission are passed
    /// in `argument_ids_to_remove` and released again, which may cascade;
    /// the ids freed that way are returned.
    pub fn update_submitted_task_references(
        &self,
        return_ids: &[ObjectID],
        argument_ids_to_add: &[ObjectID],
        argument_ids_to_remove: &[ObjectID],
    ) -> Vec<ObjectID> {
        let mut state = self.state.lock();
        for return_id in return_ids {
            self.update_object_pending_creation_internal(&mut state, return_id, true);
        }
        for argument_id in argument_ids_to_add {
            tracing::debug!("Increment ref count for submitted task argument {}", argument_id);
            // The entry may be missing if a large argument is transparently
            // passed by reference without the frontend ever holding the id.
            let reference = state.object_id_refs.entry(*argument_id).or_default();
            let was_in_use = reference.ref_count() > 0;
            reference.submitted_task_ref_count += 1;
            // The lineage pin is released once the task finishes and can no
            // longer be retried.
            reference.lineage_ref_count += 1;
            let in_use = reference.ref_count() > 0;
            if !was_in_use && in_use {
                self.set_nested_ref_in_use_recursive(&mut state, argument_id);
            }
        }
        let mut deleted = Vec::new();
        self.remove_submitted_task_references(
            &mut state,
            argument_ids_to_remove,
            /*release_lineage=*/ true,
            &mut deleted,
        );
        deleted
    }

    /// Re-pin the arguments of a task that is being retried. The lineage pins
    /// were never released, so only the submitted-task counts change. Panics
    /// if an argument is unknown: resubmission requires the lineage to exist.
    pub fn update_resubmitted_task_references(&self, argument_ids: &[ObjectID]) {
        let mut state = self.state.lock();
        for argument_id in argument_ids {
            let reference = state
                .object_id_refs
                .get_mut(argument_id)
                .unwrap_or_else(|| panic!("resubmitted task argument {} is not in scope", argument_id));
            let was_in_use = reference.ref_count() > 0;
            reference.submitted_task_ref_count += 1;
            let in_use = reference.ref_count() > 0;
            if !was_in_use && in_use {
                self.set_nested_ref_in_use_recursive(&mut state, argument_id);
            }
        }
    }

    /// Account for a finished task: clear pending-creation on the returns,
    /// merge the borrowed refs the executing worker reported, then release
    /// the submitted-task pins on the arguments. Merging must happen first:
    /// inner ids serialized inside arguments must gain their borrowers before
    /// the outer arguments lose their submitted counts, otherwise a transient
    /// zero count would free them.
    pub fn update_finished_task_references(
        &self,
        return_ids: &[ObjectID],
        argument_ids: &[ObjectID],
        release_lineage: bool,
        worker_addr: &WorkerAddress,
        borrowed_refs: &[ObjectReferenceCount],
    ) -> Vec<ObjectID> {
        let mut state = self.state.lock();
        for return_id in return_ids {
            self.update_object_pending_creation_internal(&mut state, return_id, false);
        }
        let refs = reference_table_from_proto(borrowed_refs);
        if !refs.is_empty() {
            assert!(!worker_addr.worker_id.is_nil());
        }
        for argument_id in argument_ids {
            self.merge_remote_borrowers(&mut state, argument_id, worker_addr, &refs);
        }
        let mut deleted = Vec::new();
        self.remove_submitted_task_references(&mut state, argument_ids, release_lineage, &mut deleted);
        deleted
    }

    fn remove_submitted_task_references(
        &self,
        state: &mut ReferenceTable,
        argument_ids: &[ObjectID],
        release_lineage: bool,
        deleted: &mut Vec<ObjectID>,
    ) {
        for argument_id in argument_ids {
            tracing::debug!("Releasing ref for submitted task argument {}", argument_id);
            let ref_count_zero = {
                let Some(reference) = state.object_id_refs.get_mut(argument_id) else {
                    tracing::warn!(
                        "Tried to decrease ref count for nonexistent object ID: {}",
                        argument_id
                    );
                    continue;
                };
                assert!(
                    reference.submitted_task_ref_count > 0,
                    "submitted task ref count underflow for {}",
                    argument_id
                );
                reference.submitted_task_ref_count -= 1;
                if release_lineage && reference.lineage_ref_count > 0 {
                    reference.lineage_ref_count -= 1;
                }
                reference.ref_count() == 0
            };
            if ref_count_zero {
                self.delete_reference_internal(state, argument_id, deleted);
            }
        }
    }

    // ─── Borrowed objects ───────────────────────────────────────────────

    /// Record the owner of a borrowed object, and that we received it nested
    /// inside `outer_id` (pass a nil id when it arrived directly). Safe to
    /// call for an id first seen through `add_local_reference`.
    pub fn add_borrowed_object(
        &self,
        object_id: &ObjectID,
        outer_id: &ObjectID,
        owner_address: WorkerAddress,
        foreign_owner_already_monitoring: bool,
    ) -> bool {
        let mut state = self.state.lock();
        self.add_borrowed_object_internal(
            &mut state,
            object_id,
            outer_id,
            owner_address,
            foreign_owner_already_monitoring,
        )
    }

    fn add_borrowed_object_internal(
        &self,
        state: &mut ReferenceTable,
        object_id: &ObjectID,
        outer_id: &ObjectID,
        owner_address: WorkerAddress,
        foreign_owner_already_monitoring: bool,
    ) -> bool {
        tracing::debug!("Adding borrowed object {}", object_id);
        {
            let reference = state.object_id_refs.entry(*object_id).or_default();
            reference.owner_address = Some(owner_address);
            reference.foreign_owner_already_monitoring |= foreign_owner_already_monitoring;
        }

        if !outer_id.is_nil() {
            let outer_is_borrowed = state
                .object_id_refs
                .get(outer_id)
                .map(|outer| !outer.owned_by_us)
                .unwrap_or(false);
            if outer_is_borrowed {
                assert_ne!(object_id, outer_id);
                tracing::debug!(
                    "Setting borrowed inner ID {} contained_in_borrowed: {}",
                    object_id,
                    outer_id
                );
                state
                    .object_id_refs
                    .get_mut(object_id)
                    .expect("just inserted")
                    .mutable_nested()
                    .contained_in_borrowed_ids
                    .insert(*outer_id);
                state
                    .object_id_refs
                    .get_mut(outer_id)
                    .expect("checked above")
                    .mutable_nested()
                    .contains
                    .insert(*object_id);
                // The inner ref is in use, so it must be reported to its
                // owner when the outer borrowed id is reported.
                let in_use = state
                    .object_id_refs
                    .get(object_id)
                    .map(|r| r.ref_count() > 0)
                    .unwrap_or(false);
                if in_use {
                    self.set_nested_ref_in_use_recursive(state, object_id);
                }
            }
        }

        let ref_count_zero = state
            .object_id_refs
            .get(object_id)
            .map(|r| r.ref_count() == 0)
            .unwrap_or(false);
        if ref_count_zero {
            self.delete_reference_internal(state, object_id, &mut Vec::new());
        }
        true
    }

    /// Mark every borrowed outer id (transitively) of `object_id` as having a
    /// nested ref in use, so the chain is reported to the owners even if the
    /// outers were never unwrapped here.
    fn set_nested_ref_in_use_recursive(&self, state: &mut ReferenceTable, object_id: &ObjectID) {
        let contained_in: Vec<ObjectID> = state
            .object_id_refs
            .get(object_id)
            .map(|r| r.nested().contained_in_borrowed_ids.iter().copied().collect())
            .unwrap_or_default();
        for outer_id in contained_in {
            let outer = state
                .object_id_refs
                .get_mut(&outer_id)
                .expect("containment edge points at a missing reference");
            if !outer.has_nested_refs_to_report {
                outer.has_nested_refs_to_report = true;
                self.set_nested_ref_in_use_recursive(state, &outer_id);
            }
        }
    }

    /// Explicitly register a borrower for an object we own, e.g. when the
    /// object is handed off out of band. Opens a watch that keeps the object
    /// pinned until the borrower reports back.
    pub fn add_borrower_address(&self, object_id: &ObjectID, borrower_address: WorkerAddress) {
        let mut state = self.state.lock();
        let reference = state
            .object_id_refs
            .get_mut(object_id)
            .unwrap_or_else(|| panic!("cannot add a borrower for untracked object {}", object_id));
        assert!(
            reference.owned_by_us,
            "add_borrower_address may only be used by the owner"
        );
        assert_ne!(
            borrower_address.worker_id, self.rpc_address.worker_id,
            "the borrower cannot be the owner itself"
        );
        tracing::debug!("Add borrower {} for object {}", borrower_address, object_id);
        let inserted = reference
            .mutable_borrow_info()
            .borrowers
            .insert(borrower_address.clone());
        if inserted {
            self.wait_for_ref_removed(&state, object_id, &borrower_address, ObjectID::nil());
        }
    }

    /// Merge a reference sub-table reported by `worker_addr` into our view of
    /// `object_id`. New transitive borrowers of objects we own get their own
    /// watches; information about objects we borrow is forwarded up toward
    /// their owners. Idempotent: set insertions carry identity, so crossed
    /// messages cannot corrupt state.
    fn merge_remote_borrowers(
        &self,
        state: &mut ReferenceTable,
        object_id: &ObjectID,
        worker_addr: &WorkerAddress,
        borrowed_refs: &HashMap<ObjectID, Reference>,
    ) {
        let Some(borrower_ref) = borrowed_refs.get(object_id) else {
            return;
        };
        tracing::debug!(
            "Merging ref {}: borrower reports {} borrowers, local: {}, submitted: {}, \
             contained_in_owned: {}, stored_in_objects: {}",
            object_id,
            borrower_ref.borrow_info().borrowers.len(),
            borrower_ref.local_ref_count,
            borrower_ref.submitted_task_ref_count,
            borrower_ref.nested().contained_in_owned.len(),
            borrower_ref.borrow_info().stored_in_objects.len(),
        );

        state.object_id_refs.entry(*object_id).or_default();
        let mut new_borrowers: Vec<WorkerAddress> = Vec::new();
        {
            let reference = state.object_id_refs.get_mut(object_id).expect("just inserted");
            // The reporting worker still uses the reference, so it remains a
            // borrower itself.
            if borrower_ref.ref_count() > 0
                && reference
                    .mutable_borrow_info()
                    .borrowers
                    .insert(worker_addr.clone())
            {
                tracing::debug!("Adding borrower {} to object {}", worker_addr, object_id);
                new_borrowers.push(worker_addr.clone());
            }
            // Any workers the reporter passed the id to are borrowers too.
            for nested_borrower in &borrower_ref.borrow_info().borrowers {
                if reference
                    .mutable_borrow_info()
                    .borrowers
                    .insert(nested_borrower.clone())
                {
                    tracing::debug!("Adding borrower {} to object {}", nested_borrower, object_id);
                    new_borrowers.push(nested_borrower.clone());
                }
            }
        }

        // The reporter saw this ref nested inside borrowed outer objects;
        // copy those containment edges into our table.
        for contained_in_borrowed_id in &borrower_ref.nested().contained_in_borrowed_ids {
            let owner = borrower_ref
                .owner_address
                .clone()
                .expect("borrowed reference is missing its owner address");
            self.add_borrowed_object_internal(
                state,
                object_id,
                contained_in_borrowed_id,
                owner,
                /*foreign_owner_already_monitoring=*/ false,
            );
        }

        let owned_by_us = state
            .object_id_refs
            .get(object_id)
            .map(|r| r.owned_by_us)
            .unwrap_or(false);
        if owned_by_us {
            // Keep the value pinned until every new borrower reports back.
            for addr in &new_borrowers {
                self.wait_for_ref_removed(state, object_id, addr, ObjectID::nil());
            }
        } else {
            // We received counts from another borrower; make sure they are
            // forwarded on to the owner.
            self.set_nested_ref_in_use_recursive(state, object_id);
        }

        // The reporter stored this id inside objects it does not own.
        for (stored_in_object, owner) in &borrower_ref.borrow_info().stored_in_objects {
            self.add_nested_object_ids_internal(state, stored_in_object, &[*object_id], owner);
        }

        // Recurse for borrowers of objects nested inside this one.
        for inner_id in &borrower_ref.nested().contains {
            self.merge_remote_borrowers(state, inner_id, worker_addr, borrowed_refs);
        }
    }

    /// A borrower's ref-removed reply arrived (or the borrower died): absorb
    /// whatever it reported, then drop it from the borrower set.
    fn cleanup_borrowers_on_ref_removed(
        &self,
        new_borrower_refs: &HashMap<ObjectID, Reference>,
        object_id: &ObjectID,
        borrower_addr: &WorkerAddress,
    ) {
        let mut state = self.state.lock();
        self.merge_remote_borrowers(&mut state, object_id, borrower_addr, new_borrower_refs);

        let removed = state
            .object_id_refs
            .get_mut(object_id)
            .unwrap_or_else(|| panic!("reference {} removed while a borrower watch was live", object_id))
            .mutable_borrow_info()
            .borrowers
            .remove(borrower_addr);
        assert!(removed, "borrower was not registered for object {}", object_id);
        self.delete_reference_internal(&mut state, object_id, &mut Vec::new());
    }

    /// Open a watch on `addr`'s ref-removed channel for an object we own.
    /// The reply payload is the sub-table of references the borrower handed
    /// out; a publisher failure counts as an empty reply.
    fn wait_for_ref_removed(
        &self,
        state: &ReferenceTable,
        object_id: &ObjectID,
        addr: &WorkerAddress,
        contained_in_id: ObjectID,
    ) {
        tracing::debug!("Waiting for ref removed: object {} borrower {}", object_id, addr);
        let reference = state
            .object_id_refs
            .get(object_id)
            .expect("cannot watch borrowers of an untracked object");
        // Only the owner may watch borrowers.
        assert!(reference.owned_by_us);
        let owner_address = reference
            .owner_address
            .clone()
            .expect("owned reference is missing its owner address");

        let sub_message = SubMessage {
            inner_message: Some(sub_message::InnerMessage::WorkerRefRemovedSubMessage(
                WorkerRefRemovedSubMessage {
                    reference: Some(ObjectReference {
                        object_id: object_id.binary(),
                        owner_address: Some(owner_address.to_proto()),
                    }),
                    contained_in_id: contained_in_id.binary(),
                    intended_worker_id: addr.worker_id.binary(),
                    subscriber_worker_id: self.rpc_address.worker_id.binary(),
                },
            )),
        };

        let weak_self = self.weak_self.clone();
        let borrower = addr.clone();
        let watched_id = *object_id;
        let on_published: MessagePublishedCallback = Box::new(move |message: PubMessage| {
            let Some(counter) = weak_self.upgrade() else {
                return;
            };
            let new_borrower_refs = message
                .ref_removed_message()
                .map(|m| reference_table_from_proto(&m.borrowed_refs))
                .unwrap_or_default();
            tracing::debug!(
                "Ref removed reply for object {} from borrower {}",
                watched_id,
                borrower
            );
            counter.cleanup_borrowers_on_ref_removed(&new_borrower_refs, &watched_id, &borrower);
            counter.subscriber.unsubscribe(
                ChannelType::WorkerRefRemovedChannel,
                &borrower,
                watched_id.as_bytes(),
            );
        });

        let weak_self = self.weak_self.clone();
        let borrower = addr.clone();
        let on_publisher_failed: PublisherFailedCallback =
            Box::new(move |key_id: &[u8], _status| {
                let Some(counter) = weak_self.upgrade() else {
                    return;
                };
                // A dead borrower publishes nothing; treat it as an empty
                // reply.
                let object_id = ObjectID::from_binary(key_id);
                tracing::debug!(
                    "Borrower {} of object {} failed before replying",
                    borrower,
                    object_id
                );
                counter.cleanup_borrowers_on_ref_removed(&HashMap::new(), &object_id, &borrower);
            });

        self.subscriber.subscribe(
            sub_message,
            ChannelType::WorkerRefRemovedChannel,
            addr,
            object_id.as_bytes(),
            on_published,
            on_publisher_failed,
        );
    }

    // ─── Borrower side ──────────────────────────────────────────────────

    /// Called when a task on this worker finishes. Serializes the state of
    /// every borrowed id reachable from the task's arguments (deducting the
    /// artificial local ref the runtime added for the task's duration), clears
    /// the locally accumulated borrow info — ownership of that information
    /// transfers to the owner — and drops the artificial local refs.
    ///
    /// Returns the serialized sub-table and the ids whose values became
    /// unreachable.
    pub fn pop_and_clear_local_borrowers(
        &self,
        borrowed_ids: &[ObjectID],
    ) -> (Vec<ObjectReferenceCount>, Vec<ObjectID>) {
        let mut state = self.state.lock();
        let mut borrowed_refs = HashMap::new();
        for borrowed_id in borrowed_ids {
            assert!(
                self.get_and_clear_local_borrowers_internal(
                    &mut state,
                    borrowed_id,
                    /*for_ref_removed=*/ false,
                    /*deduct_local_ref=*/ true,
                    &mut borrowed_refs,
                ),
                "untracked borrowed object {}",
                borrowed_id
            );
        }
        let proto = reference_table_to_proto(borrowed_refs);

        let mut deleted = Vec::new();
        for borrowed_id in borrowed_ids {
            tracing::debug!("Remove local reference to borrowed object {}", borrowed_id);
            let ref_count_zero = {
                let Some(reference) = state.object_id_refs.get_mut(borrowed_id) else {
                    tracing::warn!(
                        "Tried to decrease ref count for nonexistent object {}",
                        borrowed_id
                    );
                    continue;
                };
                if reference.local_ref_count == 0 {
                    tracing::warn!(
                        "Tried to decrease ref count for object {} that has count 0. This \
                         should only happen if the object was explicitly freed earlier.",
                        borrowed_id
                    );
                } else {
                    reference.local_ref_count -= 1;
                }
                reference.ref_count() == 0
            };
            if ref_count_zero {
                self.delete_reference_internal(&mut state, borrowed_id, &mut deleted);
            }
        }
        (proto, deleted)
    }

    fn get_and_clear_local_borrowers_internal(
        &self,
        state: &mut ReferenceTable,
        object_id: &ObjectID,
        for_ref_removed: bool,
        deduct_local_ref: bool,
        borrowed_refs: &mut HashMap<ObjectID, ObjectReferenceCount>,
    ) -> bool {
        let contained: Vec<ObjectID> = {
            let Some(reference) = state.object_id_refs.get_mut(object_id) else {
                return false;
            };
            // We may receive an id we own, e.g. executing a task whose
            // arguments contain an object created by an earlier task here.
            // There is nothing to report back in that case.
            if reference.owned_by_us {
                return true;
            }
            if for_ref_removed || !reference.foreign_owner_already_monitoring {
                if !borrowed_refs.contains_key(object_id) {
                    borrowed_refs.insert(*object_id, reference.to_proto(deduct_local_ref));
                    // The receiver of the sub-table merges this borrow info
                    // into its own until all active borrowers reach the
                    // owner. If a foreign owner is already waiting on this
                    // ref, keep the metadata so that owner still learns about
                    // the parent task's borrow.
                    reference.borrow = None;
                }
            }
            let contained = reference.nested().contains.iter().copied().collect();
            reference.has_nested_refs_to_report = false;
            contained
        };
        for contained_id in contained {
            self.get_and_clear_local_borrowers_internal(
                state,
                &contained_id,
                for_ref_removed,
                /*deduct_local_ref=*/ false,
                borrowed_refs,
            );
        }
        true
    }

    /// Report on one id directly because its owner asked (ref-removed
    /// channel): publish the sub-table of references we handed out for it.
    pub fn handle_ref_removed(&self, object_id: &ObjectID) {
        let mut state = self.state.lock();
        self.handle_ref_removed_internal(&mut state, object_id);
    }

    fn handle_ref_removed_internal(&self, state: &mut ReferenceTable, object_id: &ObjectID) {
        let mut borrowed_refs = HashMap::new();
        let _ = self.get_and_clear_local_borrowers_internal(
            state,
            object_id,
            /*for_ref_removed=*/ true,
            /*deduct_local_ref=*/ false,
            &mut borrowed_refs,
        );
        let message = PubMessage {
            channel_type: ChannelType::WorkerRefRemovedChannel as i32,
            key_id: object_id.binary(),
            inner_message: Some(pub_message::InnerMessage::WorkerRefRemovedMessage(
                WorkerRefRemovedMessage {
                    borrowed_refs: reference_table_to_proto(borrowed_refs),
                },
            )),
        };
        tracing::debug!(
            "Publishing ref-removed reply for object {} with {} borrowed references",
            object_id,
            message
                .ref_removed_message()
                .map(|m| m.borrowed_refs.len())
                .unwrap_or(0)
        );
        self.publisher.publish(message);
    }

    /// An owner's watch arrived for `object_id`, received inside
    /// `contained_in_id` (nil when direct). If we already stopped borrowing,
    /// reply immediately; otherwise reply when the count reaches zero.
    pub fn handle_wait_for_ref_removed(
        &self,
        object_id: &ObjectID,
        contained_in_id: &ObjectID,
        owner_address: WorkerAddress,
    ) {
        let mut state = self.state.lock();
        tracing::debug!(
            "Received ref-removed watch for object {} (contained in {}) from owner {}",
            object_id,
            contained_in_id,
            owner_address
        );
        state.object_id_refs.entry(*object_id).or_default();

        // If we borrow the id because we own an object containing it, the
        // outer object counts toward the inner id's references: the owner
        // gets no reply until our outer object goes out of scope.
        if !contained_in_id.is_nil() {
            let rpc_address = self.rpc_address.clone();
            self.add_nested_object_ids_internal(
                &mut state,
                contained_in_id,
                &[*object_id],
                &rpc_address,
            );
        }

        let ref_count_zero = state
            .object_id_refs
            .get(object_id)
            .map(|r| r.ref_count() == 0)
            .unwrap_or(true);
        if ref_count_zero {
            tracing::debug!(
                "Ref count for borrowed object {} is already 0, replying immediately",
                object_id
            );
            self.handle_ref_removed_internal(&mut state, object_id);
            self.delete_reference_internal(&mut state, object_id, &mut Vec::new());
        } else {
            let reference = state
                .object_id_refs
                .get_mut(object_id)
                .expect("just inserted");
            if reference.ref_removed_reply_pending {
                // A second watch for the same object means the owner task
                // died and was re-executed; the newer owner wins.
                tracing::warn!(
                    "ref-removed reply already pending for object {}; the owner task must \
                     have died and been re-executed",
                    object_id
                );
            }
            reference.ref_removed_reply_pending = true;
        }
    }

    // ─── Nesting ────────────────────────────────────────────────────────

    /// Record that `object_id`'s value contains `inner_ids`. `owner_address`
    /// is the owner of the outer object: ourselves for a locally created
    /// value, or the remote caller a task returned the value to.
    pub fn add_nested_object_ids(
        &self,
        object_id: &ObjectID,
        inner_ids: &[ObjectID],
        owner_address: &WorkerAddress,
    ) {
        let mut state = self.state.lock();
        self.add_nested_object_ids_internal(&mut state, object_id, inner_ids, owner_address);
    }

    fn add_nested_object_ids_internal(
        &self,
        state: &mut ReferenceTable,
        object_id: &ObjectID,
        inner_ids: &[ObjectID],
        owner_address: &WorkerAddress,
    ) {
        assert!(!owner_address.worker_id.is_nil());
        if owner_address.worker_id == self.rpc_address.worker_id {
            // We own the outer object: a local put, or a task return whose
            // caller runs in this same process.
            let outer_in_scope = match state.object_id_refs.get_mut(object_id) {
                None => false,
                Some(outer) => {
                    assert!(outer.owned_by_us);
                    // Pin the inner objects until the outer goes out of scope.
                    for inner_id in inner_ids {
                        tracing::debug!(
                            "Setting inner ID {} contained_in_owned: {}",
                            inner_id,
                            object_id
                        );
                        outer.mutable_nested().contains.insert(*inner_id);
                    }
                    true
                }
            };
            if outer_in_scope {
                for inner_id in inner_ids {
                    let now_in_use = {
                        let inner = state.object_id_refs.entry(*inner_id).or_default();
                        let was_in_use = inner.ref_count() > 0;
                        inner.mutable_nested().contained_in_owned.insert(*object_id);
                        !was_in_use && inner.ref_count() > 0
                    };
                    if now_in_use {
                        self.set_nested_ref_in_use_recursive(state, inner_id);
                    }
                }
            }
        } else {
            // A remote caller owns the outer object (we returned the value
            // from a task executed for it).
            for inner_id in inner_ids {
                tracing::debug!(
                    "Adding borrower {} to object {}, borrower owns outer ID {}",
                    owner_address,
                    inner_id,
                    object_id
                );
                let (we_own_inner, inserted_borrower) = {
                    let inner = state.object_id_refs.entry(*inner_id).or_default();
                    if inner.owned_by_us {
                        // The caller borrows the inner object from us now.
                        (
                            true,
                            inner
                                .mutable_borrow_info()
                                .borrowers
                                .insert(owner_address.clone()),
                        )
                    } else {
                        let inserted = inner
                            .mutable_borrow_info()
                            .stored_in_objects
                            .insert(*object_id, owner_address.clone())
                            .is_none();
                        // An id can only be stored in a given return id once.
                        assert!(
                            inserted,
                            "object {} already stored in {}",
                            inner_id, object_id
                        );
                        (false, false)
                    }
                };
                if we_own_inner && inserted_borrower {
                    self.wait_for_ref_removed(state, inner_id, owner_address, *object_id);
                }
            }
        }
    }

    // ─── Deletion ───────────────────────────────────────────────────────

    /// Attempt to advance `object_id` through out-of-scope and deletion.
    /// Every mutation that can drive a count to zero funnels through here.
    fn delete_reference_internal(
        &self,
        state: &mut ReferenceTable,
        object_id: &ObjectID,
        deleted: &mut Vec<ObjectID>,
    ) {
        let Some(reference) = state.object_id_refs.get(object_id) else {
            return;
        };
        tracing::debug!("Attempting to delete object {}", object_id);

        if reference.ref_count() == 0 && reference.ref_removed_reply_pending {
            state
                .object_id_refs
                .get_mut(object_id)
                .expect("checked above")
                .ref_removed_reply_pending = false;
            tracing::debug!("Replying to pending ref-removed watch for object {}", object_id);
            self.handle_ref_removed_internal(state, object_id);
        }

        let out_of_scope = state
            .object_id_refs
            .get(object_id)
            .map(|r| r.out_of_scope())
            .unwrap_or(false);
        if out_of_scope {
            // Drop the containment edges on each inner id; this may cascade.
            let (inner_ids, owned_by_us): (Vec<ObjectID>, bool) = {
                let reference = state.object_id_refs.get(object_id).expect("checked above");
                (
                    reference.nested().contains.iter().copied().collect(),
                    reference.owned_by_us,
                )
            };
            for inner_id in inner_ids {
                if state.object_id_refs.contains_key(&inner_id) {
                    tracing::debug!("Try to delete inner object {}", inner_id);
                    {
                        let inner = state
                            .object_id_refs
                            .get_mut(&inner_id)
                            .expect("checked above");
                        if owned_by_us {
                            assert!(
                                inner.mutable_nested().contained_in_owned.remove(object_id),
                                "missing contained_in_owned edge {} -> {}",
                                inner_id,
                                object_id
                            );
                        } else {
                            assert!(
                                inner
                                    .mutable_nested()
                                    .contained_in_borrowed_ids
                                    .remove(object_id),
                                "missing contained_in_borrowed edge {} -> {}",
                                inner_id,
                                object_id
                            );
                        }
                    }
                    self.delete_reference_internal(state, &inner_id, deleted);
                }
            }
            self.on_object_out_of_scope_or_freed(state, object_id);
            deleted.push(*object_id);
            state.reconstructable_owned_objects_index.remove(object_id);
        }

        let should_delete = state
            .object_id_refs
            .get(object_id)
            .map(|r| r.should_delete(self.lineage_pinning_enabled))
            .unwrap_or(false);
        if should_delete {
            tracing::debug!("Deleting Reference to object {}", object_id);
            self.release_lineage_references(state, object_id);
            self.erase_reference(state, object_id);
        }
    }

    /// Remove the Reference from the table. Fires the ref-delete callback and
    /// publishes a failure on the locations channel so subscribers that
    /// arrive after deletion still observe the loss.
    fn erase_reference(&self, state: &mut ReferenceTable, object_id: &ObjectID) {
        self.publisher
            .publish_failure(ChannelType::WorkerObjectLocationsChannel, object_id.as_bytes());

        {
            let reference = state
                .object_id_refs
                .get(object_id)
                .expect("erasing a reference that does not exist");
            assert!(reference.should_delete(self.lineage_pinning_enabled));
        }
        state.reconstructable_owned_objects_index.remove(object_id);
        state.freed_objects.remove(object_id);
        let reference = state
            .object_id_refs
            .remove(object_id)
            .expect("checked above");
        if reference.owned_by_us {
            if object_id.is_actor_id() {
                state.num_actors_owned_by_us -= 1;
            } else {
                state.num_objects_owned_by_us -= 1;
            }
        }
        if let Some(callback) = reference.on_object_ref_delete {
            callback(object_id);
        }
        self.shutdown_if_needed(state);
    }

    /// Fire and clear the out-of-scope callbacks and release the primary copy
    /// and spill state. Runs both when the object leaves scope and when it is
    /// explicitly freed.
    fn on_object_out_of_scope_or_freed(&self, state: &mut ReferenceTable, object_id: &ObjectID) {
        let callbacks = state
            .object_id_refs
            .get_mut(object_id)
            .map(|r| std::mem::take(&mut r.on_object_out_of_scope_or_freed_callbacks))
            .unwrap_or_default();
        tracing::debug!(
            "Running {} out-of-scope callbacks for object {}",
            callbacks.len(),
            object_id
        );
        for callback in callbacks {
            callback(object_id);
        }
        if let Some(reference) = state.object_id_refs.get_mut(object_id) {
            Self::unset_object_primary_copy(reference);
        }
    }

    fn unset_object_primary_copy(reference: &mut Reference) {
        reference.pinned_at_raylet_id = None;
        if reference.spilled && !reference.spilled_node_id.is_nil() {
            reference.spilled = false;
            reference.spilled_url = String::new();
            reference.spilled_node_id = NodeID::nil();
        }
    }

    // ─── Lineage pinning ────────────────────────────────────────────────

    /// Install the lineage release hook. May be called at most once.
    pub fn set_release_lineage_callback(&self, callback: LineageReleasedCallback) {
        let mut state = self.state.lock();
        assert!(
            state.on_lineage_released.is_none(),
            "lineage release callback installed twice"
        );
        state.on_lineage_released = Some(callback);
    }

    /// Release the lineage of `object_id` and cascade through the argument
    /// ids the release callback reports. An object still in scope that loses
    /// its lineage is marked evicted so reconstruction fails cleanly.
    fn release_lineage_references(&self, state: &mut ReferenceTable, object_id: &ObjectID) -> i64 {
        let mut lineage_bytes_evicted = 0i64;
        let mut argument_ids: Vec<ObjectID> = Vec::new();

        let owned_by_us = state
            .object_id_refs
            .get(object_id)
            .map(|r| r.owned_by_us)
            .unwrap_or(false);
        if owned_by_us && state.on_lineage_released.is_some() {
            tracing::debug!("Releasing lineage for object {}", object_id);
            let released = {
                let callback = state.on_lineage_released.as_ref().expect("checked above");
                callback(object_id, &mut argument_ids)
            };
            lineage_bytes_evicted += released;
            if let Some(reference) = state.object_id_refs.get_mut(object_id) {
                if !reference.out_of_scope() && reference.is_reconstructable {
                    reference.lineage_evicted = true;
                    reference.is_reconstructable = false;
                }
            }
        }

        for argument_id in argument_ids {
            let (out_of_scope, should_delete, reply_pending) = {
                let Some(argument) = state.object_id_refs.get_mut(&argument_id) else {
                    continue;
                };
                if argument.lineage_ref_count == 0 {
                    continue;
                }
                tracing::debug!("Releasing lineage for argument {}", argument_id);
                argument.lineage_ref_count -= 1;
                (
                    argument.out_of_scope(),
                    argument.should_delete(self.lineage_pinning_enabled),
                    argument.ref_removed_reply_pending,
                )
            };
            if out_of_scope {
                self.on_object_out_of_scope_or_freed(state, &argument_id);
            }
            if should_delete {
                assert!(!reply_pending);
                lineage_bytes_evicted += self.release_lineage_references(state, &argument_id);
                self.erase_reference(state, &argument_id);
            }
        }
        lineage_bytes_evicted
    }

    /// Evict lineage oldest-first until at least `min_bytes_to_evict` bytes
    /// were reclaimed or nothing reconstructable remains. Returns the bytes
    /// actually reclaimed.
    pub fn evict_lineage(&self, min_bytes_to_evict: i64) -> i64 {
        let mut state = self.state.lock();
        let mut lineage_bytes_evicted = 0i64;
        while lineage_bytes_evicted < min_bytes_to_evict {
            let Some(object_id) = state.reconstructable_owned_objects.pop_front() else {
                break;
            };
            // Skip queue entries whose objects were already deleted.
            if !state.reconstructable_owned_objects_index.remove(&object_id) {
                continue;
            }
            assert!(
                state.object_id_refs.contains_key(&object_id),
                "lineage eviction index out of sync for {}",
                object_id
            );
            lineage_bytes_evicted += self.release_lineage_references(&mut state, &object_id);
        }
        lineage_bytes_evicted
    }

    /// Whether the object can be rebuilt from its lineage. Returns
    /// `(is_reconstructable, lineage_evicted)`; both false when lineage
    /// pinning is disabled or the object is unknown.
    pub fn is_object_reconstructable(&self, object_id: &ObjectID) -> (bool, bool) {
        if !self.lineage_pinning_enabled {
            return (false, false);
        }
        let state = self.state.lock();
        match state.object_id_refs.get(object_id) {
            None => (false, false),
            Some(reference) => (reference.is_reconstructable, reference.lineage_evicted),
        }
    }

    // ─── Free ───────────────────────────────────────────────────────────

    /// Release the store values of `object_ids` without dropping their
    /// References: the entry is kept so ownership information survives, and
    /// the id is remembered as freed until the Reference is deleted.
    pub fn free_plasma_objects(&self, object_ids: &[ObjectID]) {
        let mut state = self.state.lock();
        for object_id in object_ids {
            let owned_by_us = match state.object_id_refs.get(object_id) {
                None => {
                    tracing::warn!(
                        "Tried to free an object {} that is already out of scope",
                        object_id
                    );
                    continue;
                }
                Some(reference) => reference.owned_by_us,
            };
            state.freed_objects.insert(*object_id);
            if !owned_by_us {
                tracing::warn!(
                    "Tried to free an object {} that we did not create. The object value \
                     may not be released.",
                    object_id
                );
                continue;
            }
            // Free only the store value; the Reference stays.
            self.on_object_out_of_scope_or_freed(&mut state, object_id);
        }
    }

    pub fn is_plasma_object_freed(&self, object_id: &ObjectID) -> bool {
        self.state.lock().freed_objects.contains(object_id)
    }

    /// Clear the freed marker if the object is being written again. Returns
    /// false if the object is unknown or was not freed.
    pub fn try_mark_freed_object_in_use_again(&self, object_id: &ObjectID) -> bool {
        let mut state = self.state.lock();
        if !state.object_id_refs.contains_key(object_id) {
            return false;
        }
        state.freed_objects.remove(object_id)
    }

    // ─── Location, pinning, spill ───────────────────────────────────────

    /// Record a replica of the object on `node_id`. Returns false if the
    /// object is unknown (e.g. already evicted).
    pub fn add_object_location(&self, object_id: &ObjectID, node_id: NodeID) -> bool {
        let mut state = self.state.lock();
        if !state.object_id_refs.contains_key(object_id) {
            tracing::debug!(
                "Tried to add a location for object {} that is not in the reference table",
                object_id
            );
            return false;
        }
        self.add_object_location_internal(&mut state, object_id, node_id);
        true
    }

    fn add_object_location_internal(
        &self,
        state: &mut ReferenceTable,
        object_id: &ObjectID,
        node_id: NodeID,
    ) {
        tracing::debug!("Adding location {} for object {}", node_id, object_id);
        let inserted = state
            .object_id_refs
            .get_mut(object_id)
            .expect("caller checked existence")
            .locations
            .insert(node_id);
        // Push only on a new location: the pinned location is added eagerly,
        // so the store notification may repeat it.
        if inserted {
            self.push_to_location_subscribers(state, object_id);
        }
    }

    /// Forget a replica of the object on `node_id`. Returns false if the
    /// object is unknown.
    pub fn remove_object_location(&self, object_id: &ObjectID, node_id: &NodeID) -> bool {
        let mut state = self.state.lock();
        tracing::debug!("Removing location {} for object {}", node_id, object_id);
        if !state.object_id_refs.contains_key(object_id) {
            tracing::debug!(
                "Tried to remove a location for object {} that is not in the reference table",
                object_id
            );
            return false;
        }
        self.remove_object_location_internal(&mut state, object_id, node_id);
        true
    }

    fn remove_object_location_internal(
        &self,
        state: &mut ReferenceTable,
        object_id: &ObjectID,
        node_id: &NodeID,
    ) {
        state
            .object_id_refs
            .get_mut(object_id)
            .expect("caller checked existence")
            .locations
            .remove(node_id);
        self.push_to_location_subscribers(state, object_id);
    }

    pub fn get_object_locations(&self, object_id: &ObjectID) -> Option<HashSet<NodeID>> {
        let state = self.state.lock();
        match state.object_id_refs.get(object_id) {
            None => {
                tracing::debug!(
                    "Tried to get locations for object {} that is not in the reference table",
                    object_id
                );
                None
            }
            Some(reference) => Some(reference.locations.clone()),
        }
    }

    /// Record where the primary copy of an owned object is pinned. If the
    /// node is already dead, the primary is not set and the object is queued
    /// for recovery instead.
    pub fn update_object_pinned_at_raylet(&self, object_id: &ObjectID, raylet_id: NodeID) {
        let mut state = self.state.lock();
        if !state.object_id_refs.contains_key(object_id) {
            return;
        }
        if state.freed_objects.contains(object_id) {
            // Freed by the language frontend; nothing to pin.
            return;
        }
        let out_of_scope = {
            let reference = state.object_id_refs.get(object_id).expect("checked above");
            if let Some(existing) = reference.pinned_at_raylet_id {
                tracing::info!(
                    "Updating primary location for object {} to node {}, but it already has \
                     a primary location {}. This should only happen during reconstruction.",
                    object_id,
                    raylet_id,
                    existing
                );
            }
            // Only the owner tracks the primary copy.
            assert!(reference.owned_by_us);
            reference.out_of_scope()
        };
        if !out_of_scope {
            if (self.check_node_alive)(&raylet_id) {
                state
                    .object_id_refs
                    .get_mut(object_id)
                    .expect("checked above")
                    .pinned_at_raylet_id = Some(raylet_id);
            } else {
                Self::unset_object_primary_copy(
                    state.object_id_refs.get_mut(object_id).expect("checked above"),
                );
                state.objects_to_recover.push(*object_id);
            }
        }
    }

    /// Pinning status. Returns `None` for an unknown object; otherwise
    /// `(owned_by_us, pinned_at, spilled)`, where the latter two are only
    /// meaningful when `owned_by_us` is true.
    pub fn is_plasma_object_pinned_or_spilled(
        &self,
        object_id: &ObjectID,
    ) -> Option<(bool, Option<NodeID>, bool)> {
        let state = self.state.lock();
        state.object_id_refs.get(object_id).map(|reference| {
            if reference.owned_by_us {
                (true, reference.pinned_at_raylet_id, reference.spilled)
            } else {
                (false, None, false)
            }
        })
    }

    /// Record that the object was spilled. Rejected (with recovery queued)
    /// when the spill destination died in the meantime. Returns false if the
    /// object is unknown or already out of scope.
    pub fn handle_object_spilled(
        &self,
        object_id: &ObjectID,
        spilled_url: &str,
        spilled_node_id: NodeID,
    ) -> bool {
        let mut state = self.state.lock();
        let out_of_scope = match state.object_id_refs.get(object_id) {
            None => {
                tracing::warn!("Spilled object {} already out of scope", object_id);
                return false;
            }
            Some(reference) => reference.out_of_scope(),
        };
        if out_of_scope && !spilled_node_id.is_nil() {
            // The primary raylet already broadcast the eviction of this copy;
            // do not resurrect the spill URL as a location.
            return false;
        }

        let spilled_location_alive =
            spilled_node_id.is_nil() || (self.check_node_alive)(&spilled_node_id);
        {
            let reference = state.object_id_refs.get_mut(object_id).expect("checked above");
            reference.spilled = true;
            reference.did_spill = true;
            if spilled_location_alive {
                if !spilled_url.is_empty() {
                    reference.spilled_url = spilled_url.to_string();
                }
                if !spilled_node_id.is_nil() {
                    reference.spilled_node_id = spilled_node_id;
                }
            }
        }
        if spilled_location_alive {
            self.push_to_location_subscribers(&state, object_id);
        } else {
            tracing::debug!("Object {} spilled to dead node {}", object_id, spilled_node_id);
            Self::unset_object_primary_copy(
                state.object_id_refs.get_mut(object_id).expect("checked above"),
            );
            state.objects_to_recover.push(*object_id);
        }
        true
    }

    /// Clear all derived location state for a lost node and queue affected
    /// in-scope objects for recovery.
    pub fn reset_objects_on_removed_node(&self, raylet_id: &NodeID) {
        let mut state = self.state.lock();
        let object_ids: Vec<ObjectID> = state.object_id_refs.keys().copied().collect();
        for object_id in object_ids {
            let (lost_primary, in_scope) = {
                let reference = state.object_id_refs.get(&object_id).expect("snapshot");
                (
                    reference.pinned_at_raylet_id == Some(*raylet_id)
                        || reference.spilled_node_id == *raylet_id,
                    !reference.out_of_scope(),
                )
            };
            if lost_primary {
                Self::unset_object_primary_copy(
                    state.object_id_refs.get_mut(&object_id).expect("snapshot"),
                );
                if in_scope {
                    state.objects_to_recover.push(object_id);
                }
            }
            self.remove_object_location_internal(&mut state, &object_id, raylet_id);
        }
    }

    /// Drain the queue of objects whose primary copies were lost.
    pub fn flush_objects_to_recover(&self) -> Vec<ObjectID> {
        std::mem::take(&mut self.state.lock().objects_to_recover)
    }

    /// Size and locations for locality-aware scheduling. `None` when the
    /// object or its size is unknown.
    pub fn get_locality_data(&self, object_id: &ObjectID) -> Option<LocalityData> {
        let state = self.state.lock();
        let Some(reference) = state.object_id_refs.get(object_id) else {
            tracing::debug!("Object {} not in reference table, no locality data", object_id);
            return None;
        };
        if reference.object_size < 0 {
            tracing::debug!(
                "Reference [{}] for object {} has an unknown size, no locality data",
                reference.call_site,
                object_id
            );
            return None;
        }
        let mut nodes = reference.locations.clone();
        // The primary copy holds the object too, in memory or spilled.
        if let Some(pinned_at) = reference.pinned_at_raylet_id {
            nodes.insert(pinned_at);
        }
        Some(LocalityData {
            object_size: reference.object_size as u64,
            nodes,
        })
    }

    /// Merge externally resolved locality information for a borrowed object.
    /// Panics when called on an owned object: the owner's view is
    /// authoritative and must not be overwritten.
    pub fn report_locality_data(
        &self,
        object_id: &ObjectID,
        locations: &HashSet<NodeID>,
        object_size: u64,
    ) -> bool {
        let mut state = self.state.lock();
        let Some(reference) = state.object_id_refs.get_mut(object_id) else {
            tracing::debug!(
                "Tried to report locality data for object {} that is not in the reference \
                 table; it has probably been freed",
                object_id
            );
            return false;
        };
        assert!(
            !reference.owned_by_us,
            "report_locality_data is only for borrowed references"
        );
        for location in locations {
            reference.locations.insert(*location);
        }
        if object_size > 0 {
            reference.object_size = object_size as i64;
        }
        true
    }

    /// Flip the pending-creation bit; pushes a location update on change.
    pub fn update_object_pending_creation(&self, object_id: &ObjectID, pending_creation: bool) {
        let mut state = self.state.lock();
        self.update_object_pending_creation_internal(&mut state, object_id, pending_creation);
    }

    fn update_object_pending_creation_internal(
        &self,
        state: &mut ReferenceTable,
        object_id: &ObjectID,
        pending_creation: bool,
    ) {
        let changed = match state.object_id_refs.get_mut(object_id) {
            None => false,
            Some(reference) => {
                let changed = reference.pending_creation != pending_creation;
                reference.pending_creation = pending_creation;
                changed
            }
        };
        if changed {
            self.push_to_location_subscribers(state, object_id);
        }
    }

    pub fn is_object_pending_creation(&self, object_id: &ObjectID) -> bool {
        self.state
            .lock()
            .object_id_refs
            .get(object_id)
            .map(|r| r.pending_creation)
            .unwrap_or(false)
    }

    fn push_to_location_subscribers(&self, state: &ReferenceTable, object_id: &ObjectID) {
        let Some(reference) = state.object_id_refs.get(object_id) else {
            return;
        };
        tracing::debug!(
            "Publishing locations for object {}: {} locations, spilled url [{}], spilled \
             node {}, size {}, primary node {:?}, pending creation {}",
            object_id,
            reference.locations.len(),
            reference.spilled_url,
            reference.spilled_node_id,
            reference.object_size,
            reference.pinned_at_raylet_id,
            reference.pending_creation
        );
        let message = PubMessage {
            channel_type: ChannelType::WorkerObjectLocationsChannel as i32,
            key_id: object_id.binary(),
            inner_message: Some(pub_message::InnerMessage::WorkerObjectLocationsMessage(
                Self::fill_object_information_internal(reference),
            )),
        };
        self.publisher.publish(message);
    }

    fn fill_object_information_internal(reference: &Reference) -> WorkerObjectLocationsMessage {
        let mut message = WorkerObjectLocationsMessage {
            spilled_url: reference.spilled_url.clone(),
            spilled_node_id: reference.spilled_node_id.binary(),
            primary_node_id: reference
                .pinned_at_raylet_id
                .unwrap_or_else(NodeID::nil)
                .binary(),
            pending_creation: reference.pending_creation,
            did_spill: reference.did_spill,
            ref_removed: false,
            ..Default::default()
        };
        for node_id in &reference.locations {
            message.node_ids.push(node_id.binary());
        }
        if reference.object_size > 0 {
            message.object_size = reference.object_size as u64;
        }
        message
    }

    /// Location snapshot for an object; `ref_removed` is set when the
    /// Reference no longer exists.
    pub fn fill_object_information(&self, object_id: &ObjectID) -> WorkerObjectLocationsMessage {
        let state = self.state.lock();
        match state.object_id_refs.get(object_id) {
            None => {
                tracing::warn!(
                    "Object locations requested for object {}, but the ref was already \
                     removed. This may be a bug in the distributed reference counting \
                     protocol.",
                    object_id
                );
                WorkerObjectLocationsMessage {
                    ref_removed: true,
                    ..Default::default()
                }
            }
            Some(reference) => Self::fill_object_information_internal(reference),
        }
    }

    /// Publish the current location snapshot. Called when a subscriber
    /// appears, so it always observes an initial state; an unknown object
    /// publishes `ref_removed` plus a channel failure.
    pub fn publish_object_location_snapshot(&self, object_id: &ObjectID) {
        let state = self.state.lock();
        if !state.object_id_refs.contains_key(object_id) {
            tracing::warn!(
                "Object locations requested for object {}, but the ref was already removed. \
                 This may be a bug in the distributed reference counting protocol.",
                object_id
            );
            // Let subscribers handle the error, then fail the channel since
            // the object is unreachable.
            let message = PubMessage {
                channel_type: ChannelType::WorkerObjectLocationsChannel as i32,
                key_id: object_id.binary(),
                inner_message: Some(pub_message::InnerMessage::WorkerObjectLocationsMessage(
                    WorkerObjectLocationsMessage {
                        ref_removed: true,
                        ..Default::default()
                    },
                )),
            };
            self.publisher.publish(message);
            self.publisher
                .publish_failure(ChannelType::WorkerObjectLocationsChannel, object_id.as_bytes());
            return;
        }
        self.push_to_location_subscribers(&state, object_id);
    }

    // ─── Runtime callbacks ──────────────────────────────────────────────

    /// Run `callback` when the object goes out of scope or is freed. Returns
    /// false when the object is unknown, already out of scope but pinned by
    /// lineage (the callback might never fire), or already freed.
    pub fn add_object_out_of_scope_or_freed_callback(
        &self,
        object_id: &ObjectID,
        callback: ObjectCallback,
    ) -> bool {
        let mut state = self.state.lock();
        if state.freed_objects.contains(object_id) {
            return false;
        }
        let Some(reference) = state.object_id_refs.get_mut(object_id) else {
            return false;
        };
        if reference.out_of_scope() && !reference.should_delete(self.lineage_pinning_enabled) {
            return false;
        }
        reference
            .on_object_out_of_scope_or_freed_callbacks
            .push(callback);
        true
    }

    /// Run `callback` when the Reference is erased from the table. Returns
    /// false when the object is unknown.
    pub fn set_object_ref_deleted_callback(
        &self,
        object_id: &ObjectID,
        callback: ObjectCallback,
    ) -> bool {
        let mut state = self.state.lock();
        match state.object_id_refs.get_mut(object_id) {
            None => false,
            Some(reference) => {
                reference.on_object_ref_delete = Some(callback);
                true
            }
        }
    }

    // ─── Queries ────────────────────────────────────────────────────────

    pub fn has_reference(&self, object_id: &ObjectID) -> bool {
        self.state.lock().object_id_refs.contains_key(object_id)
    }

    /// Whether provenance for the id is known (a Reference exists).
    pub fn has_owner(&self, object_id: &ObjectID) -> bool {
        self.state.lock().object_id_refs.contains_key(object_id)
    }

    pub fn owned_by_us(&self, object_id: &ObjectID) -> bool {
        self.state
            .lock()
            .object_id_refs
            .get(object_id)
            .map(|r| r.owned_by_us)
            .unwrap_or(false)
    }

    pub fn get_owner(&self, object_id: &ObjectID) -> Option<WorkerAddress> {
        self.state
            .lock()
            .object_id_refs
            .get(object_id)
            .and_then(|r| r.owner_address.clone())
    }

    /// Batch owner lookup. Unknown ids yield a default address: such ids were
    /// created out of band and cannot be resolved.
    pub fn get_owner_addresses(&self, object_ids: &[ObjectID]) -> Vec<weft_proto::Address> {
        let state = self.state.lock();
        let mut owner_addresses = Vec::with_capacity(object_ids.len());
        for object_id in object_ids {
            let owner = state
                .object_id_refs
                .get(object_id)
                .and_then(|r| r.owner_address.as_ref());
            match owner {
                Some(address) => owner_addresses.push(address.to_proto()),
                None => {
                    warn_every_ms!(
                        weft_config().race_warning_interval_ms,
                        "Object {} has no known owner; ids generated out of band cannot be \
                         passed between tasks because no worker tracks their lifetime",
                        object_id
                    );
                    owner_addresses.push(weft_proto::Address::default());
                }
            }
        }
        owner_addresses
    }

    pub fn num_object_ids_in_scope(&self) -> usize {
        self.state.lock().object_id_refs.len()
    }

    pub fn num_objects_owned_by_us(&self) -> usize {
        self.state.lock().num_objects_owned_by_us
    }

    pub fn num_actors_owned_by_us(&self) -> usize {
        self.state.lock().num_actors_owned_by_us
    }

    pub fn get_all_in_scope_object_ids(&self) -> HashSet<ObjectID> {
        self.state.lock().object_id_refs.keys().copied().collect()
    }

    /// Snapshot of (local, submitted-task) counts per id.
    pub fn get_all_reference_counts(&self) -> HashMap<ObjectID, (usize, usize)> {
        self.state
            .lock()
            .object_id_refs
            .iter()
            .map(|(object_id, r)| {
                (*object_id, (r.local_ref_count, r.submitted_task_ref_count))
            })
            .collect()
    }

    pub fn get_tensor_transport(&self, object_id: &ObjectID) -> Option<TensorTransport> {
        self.state
            .lock()
            .object_id_refs
            .get(object_id)
            .map(|r| r.tensor_transport)
    }

    /// Export reference state for debugging, merged with pinned-store info.
    /// `limit` of -1 means no limit.
    pub fn add_object_ref_stats(
        &self,
        pinned_objects: &HashMap<ObjectID, (i64, String)>,
        stats: &mut CoreWorkerStats,
        limit: i64,
    ) {
        let state = self.state.lock();
        let mut total = state.object_id_refs.len() as i64;
        let mut count = 0i64;
        for (object_id, reference) in &state.object_id_refs {
            if limit != -1 && count >= limit {
                break;
            }
            count += 1;

            let mut info = ObjectRefInfo {
                object_id: object_id.binary(),
                call_site: reference.call_site.clone(),
                object_size: reference.object_size,
                local_ref_count: reference.local_ref_count as u64,
                submitted_task_ref_count: reference.submitted_task_ref_count as u64,
                ..Default::default()
            };
            if let Some((pinned_size, pinned_call_site)) = pinned_objects.get(object_id) {
                info.pinned_in_memory = true;
                // Fall back to the pinned-store view for missing metadata.
                if reference.object_size <= 0 {
                    info.object_size = *pinned_size;
                }
                if reference.call_site.is_empty() {
                    info.call_site = pinned_call_site.clone();
                }
            }
            for outer_id in &reference.nested().contained_in_owned {
                info.contained_in_owned.push(outer_id.binary());
            }
            stats.object_refs.push(info);
        }
        // Pinned objects with no reference entry still hold memory.
        for (object_id, (pinned_size, pinned_call_site)) in pinned_objects {
            if !state.object_id_refs.contains_key(object_id) {
                if limit != -1 && count >= limit {
                    break;
                }
                count += 1;
                total += 1;
                stats.object_refs.push(ObjectRefInfo {
                    object_id: object_id.binary(),
                    call_site: pinned_call_site.clone(),
                    object_size: *pinned_size,
                    pinned_in_memory: true,
                    ..Default::default()
                });
            }
        }
        stats.objects_total = total;
    }

    pub fn debug_string(&self) -> String {
        let state = self.state.lock();
        let mut out = format!("ReferenceTable{{size: {}", state.object_id_refs.len());
        if let Some((object_id, reference)) = state.object_id_refs.iter().next() {
            out.push_str(&format!(" sample: {}:{}", object_id, reference.debug_string()));
        }
        out.push('}');
        out
    }

    // ─── Shutdown ───────────────────────────────────────────────────────

    /// Call `shutdown` once the table drains. Fires immediately when it is
    /// already empty.
    pub fn drain_and_shutdown(&self, shutdown: Box<dyn FnOnce() + Send>) {
        let mut state = self.state.lock();
        if state.object_id_refs.is_empty() {
            drop(state);
            shutdown();
        } else {
            tracing::warn!(
                "This worker is still managing {} objects, waiting for them to go out of \
                 scope before shutting down.",
                state.object_id_refs.len()
            );
            state.shutdown_hook = Some(shutdown);
        }
    }

    fn shutdown_if_needed(&self, state: &mut ReferenceTable) {
        if state.object_id_refs.is_empty() {
            if let Some(hook) = state.shutdown_hook.take() {
                tracing::warn!(
                    "All object references have gone out of scope, shutting down worker."
                );
                hook();
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
