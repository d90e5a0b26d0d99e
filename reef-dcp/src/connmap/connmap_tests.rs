use super::{DcpConnMap, DcpEnvironment};
use crate::message::{DcpMessage, EndStreamStatus};
use crate::stream::StreamRequest;
use crate::testkit::{InMemoryBackfillStore, RecordingReplicaStore, RecordingServerGateway};
use googletest::prelude::*;
use reef_common::config::DcpConfig;
use reef_common::error::EngineError;
use reef_common::ids::{DCP_MAX_SEQNO, VBucketCount, VBucketId};
use reef_engine::checkpoint::{CheckpointLog, InMemoryCheckpointLog};
use reef_engine::item::{Item, QueuedItem, VBucketState};
use reef_engine::tasks::BackgroundTask;
use rstest::rstest;
use std::sync::Arc;

struct TestEnv {
    connmap: Arc<DcpConnMap>,
    checkpoint: Arc<InMemoryCheckpointLog>,
    gateway: Arc<RecordingServerGateway>,
}

fn test_env() -> TestEnv {
    let checkpoint = Arc::new(InMemoryCheckpointLog::new());
    let replica = RecordingReplicaStore::new();
    let gateway = RecordingServerGateway::new();
    let store = InMemoryBackfillStore::new();
    let config = DcpConfig {
        vbucket_count: VBucketCount::new(16).expect("literal vbucket count must be non-zero"),
        max_data_size: 1024 * 1024,
        slow_stream_byte_threshold: 0,
        slow_stream_idle_secs: 0,
        ..DcpConfig::default()
    };
    let connmap = DcpConnMap::new(DcpEnvironment {
        config,
        checkpoint: Arc::clone(&checkpoint) as Arc<dyn CheckpointLog>,
        backfill_store: Arc::clone(&store) as _,
        replica: Arc::clone(&replica) as _,
        gateway: Arc::clone(&gateway) as _,
    });
    TestEnv {
        connmap,
        checkpoint,
        gateway,
    }
}

fn open_request(vbucket: VBucketId) -> StreamRequest {
    StreamRequest {
        flags: 0,
        opaque: 1,
        vbucket,
        start_seqno: 0,
        end_seqno: DCP_MAX_SEQNO,
        vb_uuid: 0,
        snap_start_seqno: 0,
        snap_end_seqno: 0,
    }
}

fn append_mutations(checkpoint: &InMemoryCheckpointLog, vbucket: VBucketId, count: u64) {
    for index in 0..count {
        let key = format!("key-{index}");
        let _ = checkpoint
            .append(
                vbucket,
                QueuedItem::Mutation(Item::mutation(key.as_bytes(), b"v", 0)),
            )
            .expect("append into hosted vbucket must succeed");
    }
}

#[rstest]
fn duplicate_passive_stream_is_rejected_bucket_wide() {
    let env = test_env();
    let consumer = env.connmap.new_consumer(1, "n");

    let first = env.connmap.add_passive_stream(&consumer, 1, 3, 0);
    assert_that!(first, eq(Ok(())));

    let second = env.connmap.add_passive_stream(&consumer, 2, 3, 0);
    assert_that!(second, eq(Err(EngineError::KeyExists)));

    // The rule holds across consumer connections, not just within one.
    let other = env.connmap.new_consumer(2, "m");
    let third = env.connmap.add_passive_stream(&other, 3, 3, 0);
    assert_that!(third, eq(Err(EngineError::KeyExists)));

    env.connmap.shutdown_all_connections();
}

#[rstest]
fn duplicate_name_evicts_previous_connection_within_one_sweep() {
    let env = test_env();
    let first = env.connmap.new_producer(1, "x", false);
    let second = env.connmap.new_producer(2, "x", false);

    assert_that!(first.core().do_disconnect(), eq(true));
    assert_that!(second.core().do_disconnect(), eq(false));
    assert_that!(env.connmap.conn_count(), eq(1_usize));
    assert_that!(env.connmap.dead_conn_count(), eq(1_usize));

    env.connmap.manage_connections();
    assert_that!(env.connmap.dead_conn_count(), eq(0_usize));
    assert_that!(&env.gateway.released_cookies(), eq(&vec![1_u64]));
    assert_that!(env.connmap.find_by_cookie(1).is_none(), eq(true));
    assert_that!(env.connmap.find_by_cookie(2).is_some(), eq(true));
}

#[rstest]
fn duplicate_cookie_evicts_previous_connection() {
    let env = test_env();
    let first = env.connmap.new_producer(7, "a", false);
    let _second = env.connmap.new_producer(7, "b", false);

    assert_that!(first.core().do_disconnect(), eq(true));
    assert_that!(env.connmap.conn_count(), eq(1_usize));
    let bound = env
        .connmap
        .find_by_cookie(7)
        .expect("the new connection must own the cookie");
    assert_that!(bound.core().name(), eq("eq_dcpq:b"));
}

#[rstest]
fn stream_request_validates_cookie_window_and_vbucket() {
    let env = test_env();
    env.checkpoint.create_vbucket(0, VBucketState::Active);
    let _producer = env.connmap.new_producer(1, "p", false);

    assert_that!(env.connmap.stream_request(1, open_request(0)), eq(Ok(())));
    assert_that!(
        env.connmap.stream_request(1, open_request(0)),
        eq(Err(EngineError::KeyExists))
    );
    assert_that!(
        env.connmap.stream_request(99, open_request(0)),
        eq(Err(EngineError::Disconnect))
    );
    assert_that!(
        env.connmap.stream_request(1, open_request(5)),
        eq(Err(EngineError::NotMyVbucket))
    );

    let inverted = StreamRequest {
        start_seqno: 10,
        end_seqno: 5,
        ..open_request(0)
    };
    let result = env.connmap.stream_request(1, inverted);
    assert_that!(result.is_err(), eq(true));
}

#[rstest]
fn notify_vb_connections_feeds_in_memory_streams() {
    let env = test_env();
    env.checkpoint.create_vbucket(4, VBucketState::Active);
    let producer = env.connmap.new_producer(9, "p", false);
    env.connmap
        .stream_request(9, open_request(4))
        .expect("stream request must succeed");

    // First pull moves the backlog-served stream into the in-memory phase.
    assert_that!(producer.next_message().is_none(), eq(true));

    append_mutations(&env.checkpoint, 4, 1);
    env.connmap.notify_vb_connections(4, 1);
    assert_that!(env.connmap.processor().queue_len(), eq(1_usize));
    let _ = env.connmap.processor().run_once();

    let marker = producer.next_message().expect("marker must be ready");
    assert_that!(
        matches!(marker, DcpMessage::SnapshotMarker { .. }),
        eq(true)
    );
    let mutation = producer.next_message().expect("mutation must be ready");
    assert_that!(mutation.by_seqno(), eq(Some(1_u64)));
}

#[rstest]
fn slow_stream_is_evicted_under_the_stripe_lock_only() {
    let env = test_env();
    env.checkpoint.create_vbucket(7, VBucketState::Active);
    let producer = env.connmap.new_producer(3, "slowp", false);
    env.connmap
        .stream_request(3, open_request(7))
        .expect("stream request must succeed");
    assert_that!(producer.next_message().is_none(), eq(true));

    append_mutations(&env.checkpoint, 7, 3);
    env.connmap.notify_vb_connections(7, 3);
    let _ = env.connmap.processor().run_once();

    assert_that!(env.connmap.close_slow_stream(7, "eq_dcpq:slowp"), eq(true));
    assert_that!(env.connmap.close_slow_stream(8, "eq_dcpq:slowp"), eq(false));

    let mut last = None;
    while let Some(message) = producer.next_message() {
        last = Some(message);
    }
    let Some(DcpMessage::StreamEnd { status, .. }) = last else {
        panic!("the evicted stream must end with a stream-end message");
    };
    assert_that!(status, eq(EndStreamStatus::Slow));
    let stream = producer.find_stream(7).expect("stream entry must remain");
    assert_that!(stream.core().is_active(), eq(false));
}

#[rstest]
fn shutdown_closes_releases_and_empties_every_table() {
    let env = test_env();
    for vbucket in 0..3 {
        env.checkpoint.create_vbucket(vbucket, VBucketState::Active);
    }
    let producer_one = env.connmap.new_producer(1, "p1", false);
    let producer_two = env.connmap.new_producer(2, "p2", false);
    let consumer = env.connmap.new_consumer(3, "c1");

    env.connmap
        .stream_request(1, open_request(0))
        .expect("stream request must succeed");
    env.connmap
        .stream_request(2, open_request(1))
        .expect("stream request must succeed");
    env.connmap
        .add_passive_stream(&consumer, 1, 2, 0)
        .expect("passive stream must be added");

    env.connmap.shutdown_all_connections();

    // (a) every stream is closed.
    let closed_producer_streams = [producer_one.find_stream(0), producer_two.find_stream(1)];
    for stream in closed_producer_streams.into_iter().flatten() {
        assert_that!(stream.core().is_active(), eq(false));
    }
    let passive = consumer.find_stream(2).expect("stream entry must remain");
    assert_that!(passive.core().is_active(), eq(false));

    // (b) each connection is released exactly once.
    let mut released = env.gateway.released_cookies();
    released.sort_unstable();
    assert_that!(&released, eq(&vec![1_u64, 2, 3]));

    // (c) the registry tables are empty.
    assert_that!(env.connmap.conn_count(), eq(0_usize));
    assert_that!(env.connmap.dead_conn_count(), eq(0_usize));
    for cookie in 1..=3 {
        assert_that!(env.connmap.find_by_cookie(cookie).is_none(), eq(true));
    }

    // (d) the per-vbucket index is empty.
    for vbucket in 0..3 {
        assert_that!(env.connmap.vb_conn_count(vbucket), eq(0_usize));
    }
}

#[rstest]
fn closing_passive_streams_empties_the_vbucket_index() {
    let env = test_env();
    let consumer = env.connmap.new_consumer(5, "c");
    for vbucket in 0..4_u16 {
        env.connmap
            .add_passive_stream(&consumer, u32::from(vbucket), vbucket, 0)
            .expect("passive stream must be added");
        assert_that!(env.connmap.vb_conn_count(vbucket), eq(1_usize));
    }

    env.connmap.disconnect(5);
    assert_that!(env.connmap.dead_conn_count(), eq(1_usize));

    env.connmap.manage_connections();
    for vbucket in 0..4 {
        assert_that!(env.connmap.vb_conn_count(vbucket), eq(0_usize));
    }
    assert_that!(&env.gateway.released_cookies(), eq(&vec![5_u64]));
}

#[rstest]
fn vbucket_state_change_fans_out_by_role() {
    let env = test_env();
    env.checkpoint.create_vbucket(0, VBucketState::Active);
    let producer = env.connmap.new_producer(1, "p", false);
    let consumer = env.connmap.new_consumer(2, "c");
    env.connmap
        .stream_request(1, open_request(0))
        .expect("stream request must succeed");
    env.connmap
        .add_passive_stream(&consumer, 1, 1, 0)
        .expect("passive stream must be added");

    env.connmap
        .vbucket_state_changed(0, VBucketState::Replica, false);
    let active = producer.find_stream(0).expect("stream entry must remain");
    assert_that!(active.core().is_active(), eq(false));
    assert_that!(consumer.is_stream_present(1), eq(true));

    env.connmap.vbucket_state_changed(1, VBucketState::Dead, true);
    assert_that!(consumer.is_stream_present(1), eq(false));

    env.connmap.shutdown_all_connections();
}

#[rstest]
fn manage_tick_notifies_paused_reserved_connections_once() {
    let env = test_env();
    let producer = env.connmap.new_producer(1, "p", false);
    assert_that!(producer.next_message().is_none(), eq(true));
    assert_that!(producer.core().is_paused(), eq(true));

    env.connmap.manage_connections();
    env.connmap.manage_connections();

    // The second sweep sees notify_sent with a fresh walk time and stays quiet.
    assert_that!(&env.gateway.notified_cookies(), eq(&vec![(1_u64, true)]));
}

#[rstest]
fn stats_surface_dead_connection_count() {
    let env = test_env();
    let _producer = env.connmap.new_producer(1, "p", false);
    env.connmap.disconnect(1);

    let mut stats = Vec::new();
    env.connmap.append_stats(&mut stats);
    let dead = stats
        .iter()
        .find(|(key, _)| key == "ep_dcp_dead_conn_count")
        .map(|(_, value)| value.as_str());
    assert_that!(dead, eq(Some("1")));
}

#[rstest]
fn backfill_environment_is_wired_through_the_registry() {
    let env = test_env();
    // 1 MiB quota keeps exactly one admitted backfill (see the admission unit tests).
    assert_that!(
        env.connmap.admission().max_active_snoozing_backfills(),
        eq(1_u64)
    );
    env.connmap.update_max_active_snoozing_backfills(0);
    assert_that!(
        env.connmap.admission().max_active_snoozing_backfills(),
        eq(1_u64)
    );

    assert_that!(env.connmap.min_compression_ratio(), eq(0.85_f32));
    env.connmap.update_min_compression_ratio(0.5);
    assert_that!(env.connmap.min_compression_ratio(), eq(0.5_f32));

    // The shared manager is reachable for wake-ups even with nothing queued.
    env.connmap.notify_backfill_manager_tasks();
    assert_that!(env.connmap.backfills().pending(), eq(0_usize));
}
