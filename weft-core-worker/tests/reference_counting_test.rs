// Copyright 2025 The Weft Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! End-to-end reference counting scenarios.
//!
//! Multi-worker tests run real counters against the in-process pub/sub bus:
//! each test worker registers a publisher in a shared directory and wires
//! incoming ref-removed watches to its counter, the same shape the worker's
//! pubsub service has in production.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use weft_common::address::WorkerAddress;
use weft_common::id::ObjectID;
use weft_core_worker::ReferenceCounter;
use weft_proto::{ChannelType, TensorTransport};
use weft_pubsub::{Publisher, PublisherDirectory, PublisherInterface, Subscriber, SubscriberInterface};
use weft_test_utils::mock_pubsub::{MockWorkerPublisher, MockWorkerSubscriber};
use weft_test_utils::wait::wait_until;
use weft_test_utils::{init_test_logging, node_id_with_tag, object_id_with_tag, random_worker_address};

struct TestWorker {
    counter: Arc<ReferenceCounter>,
    address: WorkerAddress,
}

/// Start a worker on the shared bus: counter + publisher + subscriber, with
/// incoming ref-removed watches routed into the counter.
fn spawn_worker(directory: &Arc<PublisherDirectory>) -> TestWorker {
    let address = random_worker_address();
    let publisher = Arc::new(Publisher::with_capacity(64));
    directory.register(address.worker_id, Arc::clone(&publisher));
    let subscriber = Arc::new(Subscriber::new(Arc::clone(directory)));
    let counter = ReferenceCounter::new(
        address.clone(),
        Arc::clone(&publisher) as Arc<dyn PublisherInterface>,
        subscriber as Arc<dyn SubscriberInterface>,
        Box::new(|_node_id| true),
        /*lineage_pinning_enabled=*/ false,
    );

    let counter_weak = Arc::downgrade(&counter);
    publisher.set_subscription_handler(Box::new(move |channel, _key_id, sub_message| {
        if channel != ChannelType::WorkerRefRemovedChannel {
            return;
        }
        let Some(counter) = counter_weak.upgrade() else {
            return;
        };
        let Some(request) = sub_message.ref_removed_sub_message() else {
            return;
        };
        let reference = request.reference.as_ref().expect("watch without reference");
        let object_id = ObjectID::from_binary(&reference.object_id);
        let contained_in_id = ObjectID::from_binary(&request.contained_in_id);
        let owner = WorkerAddress::from_proto(
            reference.owner_address.as_ref().expect("watch without owner"),
        );
        counter.handle_wait_for_ref_removed(&object_id, &contained_in_id, owner);
    }));

    TestWorker { counter, address }
}

fn add_owned(worker: &TestWorker, object_id: ObjectID, add_local_ref: bool) {
    worker.counter.add_owned_object(
        object_id,
        &[],
        worker.address.clone(),
        "test",
        -1,
        /*is_reconstructable=*/ true,
        add_local_ref,
        None,
        TensorTransport::ObjectStore,
    );
}

/// A counter wired to deterministic mocks, for single-worker scenarios.
fn mock_counter(lineage_pinning_enabled: bool) -> (Arc<ReferenceCounter>, Arc<MockWorkerPublisher>, WorkerAddress) {
    let publisher = Arc::new(MockWorkerPublisher::new());
    let subscriber = Arc::new(MockWorkerSubscriber::new());
    let address = random_worker_address();
    let counter = ReferenceCounter::new(
        address.clone(),
        Arc::clone(&publisher) as Arc<dyn PublisherInterface>,
        subscriber as Arc<dyn SubscriberInterface>,
        Box::new(|_node_id| true),
        lineage_pinning_enabled,
    );
    (counter, publisher, address)
}

#[test]
fn test_simple_local_lifecycle() {
    init_test_logging();
    let (counter, _publisher, address) = mock_counter(false);
    let a = object_id_with_tag(1);
    counter.add_owned_object(
        a,
        &[],
        address,
        "put",
        -1,
        true,
        /*add_local_ref=*/ true,
        None,
        TensorTransport::ObjectStore,
    );
    assert!(counter.has_reference(&a));

    let deleted = counter.remove_local_reference(&a);
    assert_eq!(deleted, vec![a]);
    assert!(!counter.has_reference(&a));
}

/// An owner's object stays pinned while a worker that executed a task on it
/// keeps borrowing, and is reclaimed once the borrower releases it.
#[tokio::test]
async fn test_borrower_pins_object_until_release() {
    init_test_logging();
    let directory = Arc::new(PublisherDirectory::new());
    let owner = spawn_worker(&directory);
    let borrower = spawn_worker(&directory);

    let a = object_id_with_tag(1);
    let ret = object_id_with_tag(2);
    add_owned(&owner, a, true);

    // Owner submits a task that takes `a` by reference.
    owner
        .counter
        .update_submitted_task_references(&[ret], &[a], &[]);

    // The borrower executes the task: the runtime pins the argument for the
    // duration, and the application keeps an extra reference.
    borrower.counter.add_local_reference(a, "task arg");
    borrower
        .counter
        .add_borrowed_object(&a, &ObjectID::nil(), owner.address.clone(), false);
    borrower.counter.add_local_reference(a, "kept by app");

    // Task finishes: the borrower reports its state, the owner merges it.
    let (borrowed_refs, _) = borrower.counter.pop_and_clear_local_borrowers(&[a]);
    owner.counter.update_finished_task_references(
        &[ret],
        &[a],
        /*release_lineage=*/ true,
        &borrower.address,
        &borrowed_refs,
    );

    // The owner dropped its own handle, but the borrower still holds one.
    owner.counter.remove_local_reference(&a);
    assert!(owner.counter.has_reference(&a));

    // The owner's watch reaches the borrower.
    wait_until("the watch reaches the borrower", Duration::from_secs(2), || {
        borrower.counter.has_reference(&a)
    })
    .await;

    // Borrower releases; the reply lets the owner reclaim the object.
    borrower.counter.remove_local_reference(&a);
    wait_until(
        "the owner reclaims after the borrower reports",
        Duration::from_secs(2),
        || !owner.counter.has_reference(&a),
    )
    .await;
    assert!(!borrower.counter.has_reference(&a));
}

/// A borrower that passed the object on reports the transitive borrower; the
/// owner then waits on both, and releasing only one does not free the object.
#[tokio::test]
async fn test_transitive_borrow() {
    init_test_logging();
    let directory = Arc::new(PublisherDirectory::new());
    let owner = spawn_worker(&directory);
    let first = spawn_worker(&directory);
    let second = spawn_worker(&directory);

    let a = object_id_with_tag(1);
    add_owned(&owner, a, true);
    owner.counter.update_submitted_task_references(&[], &[a], &[]);

    // First worker receives `a` as a task argument.
    first.counter.add_local_reference(a, "task arg");
    first
        .counter
        .add_borrowed_object(&a, &ObjectID::nil(), owner.address.clone(), false);

    // While executing, it submits a nested task passing `a` to the second
    // worker.
    first.counter.update_submitted_task_references(&[], &[a], &[]);
    second.counter.add_local_reference(a, "task arg");
    second
        .counter
        .add_borrowed_object(&a, &ObjectID::nil(), owner.address.clone(), false);
    second.counter.add_local_reference(a, "kept by app");

    // The nested task finishes first; its report reaches the first worker.
    let (second_refs, _) = second.counter.pop_and_clear_local_borrowers(&[a]);
    first.counter.update_finished_task_references(
        &[],
        &[a],
        true,
        &second.address,
        &second_refs,
    );

    // Then the outer task finishes and the owner merges the combined state:
    // the second worker appears as a transitive borrower.
    let (first_refs, _) = first.counter.pop_and_clear_local_borrowers(&[a]);
    owner.counter.update_finished_task_references(
        &[],
        &[a],
        true,
        &first.address,
        &first_refs,
    );

    owner.counter.remove_local_reference(&a);
    // The second worker still borrows: the object must survive.
    assert!(owner.counter.has_reference(&a));

    // Give the watches time to settle; the object must still be pinned.
    wait_until(
        "the watch reaches the transitive borrower",
        Duration::from_secs(2),
        || second.counter.has_reference(&a),
    )
    .await;
    assert!(owner.counter.has_reference(&a));

    // Releasing the last borrower frees the object at the owner.
    second.counter.remove_local_reference(&a);
    wait_until(
        "the owner reclaims after the transitive borrower releases",
        Duration::from_secs(2),
        || !owner.counter.has_reference(&a),
    )
    .await;
}

/// A borrowed object nested inside a locally owned object stays pinned until
/// the outer object goes out of scope, then the owner of the inner object is
/// notified.
#[tokio::test]
async fn test_nested_borrow_pins_until_outer_dropped() {
    init_test_logging();
    let directory = Arc::new(PublisherDirectory::new());
    let inner_owner = spawn_worker(&directory);
    let embedder = spawn_worker(&directory);

    let b = object_id_with_tag(1);
    let a = object_id_with_tag(2);

    // The inner owner creates `b` and hands it to the embedder, which
    // registers the borrow before the owner starts watching it.
    add_owned(&inner_owner, b, true);
    embedder.counter.add_local_reference(b, "received");
    embedder
        .counter
        .add_borrowed_object(&b, &ObjectID::nil(), inner_owner.address.clone(), false);
    inner_owner
        .counter
        .add_borrower_address(&b, embedder.address.clone());
    embedder.counter.add_owned_object(
        a,
        &[b],
        embedder.address.clone(),
        "wrap",
        -1,
        true,
        /*add_local_ref=*/ true,
        None,
        TensorTransport::ObjectStore,
    );

    // The watch from the inner owner reaches the embedder.
    wait_until("the watch reaches the embedder", Duration::from_secs(2), || {
        embedder.counter.has_reference(&b)
    })
    .await;

    // The inner owner no longer holds `b` itself; the embedder does.
    inner_owner.counter.remove_local_reference(&b);
    assert!(inner_owner.counter.has_reference(&b));

    // Dropping the embedder's direct handle on `b` is not enough: `a`'s
    // value still embeds it.
    embedder.counter.remove_local_reference(&b);
    assert!(embedder.counter.has_reference(&b));
    assert!(inner_owner.counter.has_reference(&b));

    // Dropping `a` releases `b` everywhere.
    embedder.counter.remove_local_reference(&a);
    wait_until(
        "the inner owner reclaims after the outer object is dropped",
        Duration::from_secs(2),
        || !inner_owner.counter.has_reference(&b),
    )
    .await;
}

/// Lineage pinning keeps a finished task's argument; evicting the lineage
/// releases it and marks the object non-reconstructable.
#[test]
fn test_lineage_eviction() {
    init_test_logging();
    let (counter, _publisher, address) = mock_counter(/*lineage_pinning_enabled=*/ true);
    let a = object_id_with_tag(1);
    let ret = object_id_with_tag(2);
    counter.add_owned_object(
        a,
        &[],
        address.clone(),
        "put",
        -1,
        true,
        true,
        None,
        TensorTransport::ObjectStore,
    );
    counter.update_submitted_task_references(&[ret], &[a], &[]);
    counter.update_finished_task_references(
        &[ret],
        &[a],
        /*release_lineage=*/ false,
        &random_worker_address(),
        &[],
    );
    // The task may be retried: `a` keeps a lineage pin.
    assert!(counter.has_reference(&a));

    let a_for_callback = a;
    counter.set_release_lineage_callback(Box::new(move |_object_id, out_args| {
        out_args.push(a_for_callback);
        64
    }));
    assert_eq!(counter.evict_lineage(1), 64);

    // Still in scope through the local ref, but no longer reconstructable.
    assert!(counter.has_reference(&a));
    let (reconstructable, lineage_evicted) = counter.is_object_reconstructable(&a);
    assert!(!reconstructable);
    assert!(lineage_evicted);
}

/// Losing a node clears the primary copy, queues recovery, and notifies the
/// object-locations channel.
#[test]
fn test_node_loss_resets_primary_and_recovers() {
    init_test_logging();
    let (counter, publisher, address) = mock_counter(false);
    let a = object_id_with_tag(1);
    let lost = node_id_with_tag(1);
    let survivor = node_id_with_tag(2);
    counter.add_owned_object(
        a,
        &[],
        address,
        "put",
        100,
        true,
        true,
        Some(lost),
        TensorTransport::ObjectStore,
    );
    counter.add_object_location(&a, survivor);

    counter.reset_objects_on_removed_node(&lost);

    assert_eq!(
        counter.is_plasma_object_pinned_or_spilled(&a),
        Some((true, None, false))
    );
    assert_eq!(counter.flush_objects_to_recover(), vec![a]);
    let pushed = publisher.published_on(ChannelType::WorkerObjectLocationsChannel);
    let last = pushed.last().unwrap().object_locations_message().unwrap();
    assert!(!last.node_ids.contains(&lost.binary()));
    assert!(last.node_ids.contains(&survivor.binary()));
}

/// Freeing releases the store value but keeps the Reference, and the object
/// can be marked in use again.
#[test]
fn test_free_with_surviving_reference() {
    init_test_logging();
    let (counter, _publisher, address) = mock_counter(false);
    let a = object_id_with_tag(1);
    counter.add_owned_object(
        a,
        &[],
        address,
        "put",
        -1,
        true,
        true,
        None,
        TensorTransport::ObjectStore,
    );
    counter.free_plasma_objects(&[a]);
    assert!(counter.is_plasma_object_freed(&a));
    assert!(counter.has_reference(&a));

    assert!(counter.try_mark_freed_object_in_use_again(&a));
    assert!(!counter.is_plasma_object_freed(&a));
}

/// A dead borrower never replies; the publisher failure stands in for an
/// empty report and the owner reclaims the object.
#[tokio::test]
async fn test_dead_borrower_releases_object() {
    init_test_logging();
    let directory = Arc::new(PublisherDirectory::new());
    let owner = spawn_worker(&directory);

    // The borrower worker is never registered on the bus, so the owner's
    // subscription fails over to the dead-publisher path.
    let dead_borrower = random_worker_address();

    let a = object_id_with_tag(1);
    add_owned(&owner, a, true);
    owner.counter.add_borrower_address(&a, dead_borrower);
    owner.counter.remove_local_reference(&a);

    wait_until(
        "the owner reclaims from an unreachable borrower",
        Duration::from_secs(2),
        || !owner.counter.has_reference(&a),
    )
    .await;
}

/// Ownership counters track live owned objects across workers.
#[test]
fn test_ownership_counters() {
    init_test_logging();
    let (counter, _publisher, address) = mock_counter(false);
    let a = object_id_with_tag(1);
    let b = object_id_with_tag(2);
    counter.add_owned_object(
        a,
        &[],
        address.clone(),
        "put",
        -1,
        true,
        true,
        None,
        TensorTransport::ObjectStore,
    );
    counter.add_owned_object(
        b,
        &[],
        address,
        "put",
        -1,
        true,
        true,
        None,
        TensorTransport::ObjectStore,
    );
    // A borrowed object does not count.
    let c = object_id_with_tag(3);
    counter.add_local_reference(c, "borrowed");
    counter.add_borrowed_object(&c, &ObjectID::nil(), random_worker_address(), false);

    assert_eq!(counter.num_objects_owned_by_us(), 2);
    assert_eq!(counter.num_object_ids_in_scope(), 3);

    counter.remove_local_reference(&a);
    assert_eq!(counter.num_objects_owned_by_us(), 1);

    let stats: HashMap<ObjectID, (usize, usize)> = counter.get_all_reference_counts();
    assert_eq!(stats.len(), 2);
    assert_eq!(stats[&b], (1, 0));
}
