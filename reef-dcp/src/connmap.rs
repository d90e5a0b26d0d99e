//! Connection registry: cookie/name tables, per-vbucket index, lifecycle sweeps.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use atomic_float::AtomicF32;
use hashbrown::HashMap;
use reef_common::config::DcpConfig;
use reef_common::error::{EngineError, EngineResult};
use reef_common::ids::{Cookie, Opaque, StreamFlags, VBucketId};
use reef_engine::backfill_store::BackfillStore;
use reef_engine::checkpoint::CheckpointLog;
use reef_engine::item::VBucketState;
use reef_engine::replica::ReplicaStore;
use reef_engine::server::ServerGateway;
use reef_engine::tasks::{BackgroundTask, TaskAction, WorkerHandle};

use crate::backfill::{BackfillAdmission, BackfillManager};
use crate::connection::{ConnHandle, DcpConsumer, DcpProducer, WeakConnHandle, unix_secs_now};
use crate::processor::CheckpointProcessorTask;
use crate::stream::StreamRequest;

/// Canonical prefix of every DCP connection name.
pub const CONN_NAME_PREFIX: &str = "eq_dcpq:";

/// Stripe count of the per-vbucket connection index.
const VB_CONN_STRIPES: usize = 32;
/// Minimum period of the connection-manager sweep.
const MANAGE_MIN_PERIOD: Duration = Duration::from_secs(2);
/// A paused reserved connection is re-notified after this many idle seconds.
const NOTIFY_IDLE_SECS: u64 = 5;

/// Collaborator seams the registry wires into every connection it creates.
#[derive(Clone)]
pub struct DcpEnvironment {
    /// Runtime configuration.
    pub config: DcpConfig,
    /// Producer-side checkpoint log surface.
    pub checkpoint: Arc<dyn CheckpointLog>,
    /// Producer-side historical scan surface.
    pub backfill_store: Arc<dyn BackfillStore>,
    /// Consumer-side replica apply surface.
    pub replica: Arc<dyn ReplicaStore>,
    /// Server/network layer callbacks.
    pub gateway: Arc<dyn ServerGateway>,
}

#[derive(Debug, Default)]
struct ConnTables {
    all: Vec<ConnHandle>,
    by_cookie: HashMap<Cookie, ConnHandle>,
    dead: VecDeque<ConnHandle>,
}

/// Registry owning every DCP connection of one bucket engine.
pub struct DcpConnMap {
    self_ref: Weak<DcpConnMap>,
    config: DcpConfig,
    checkpoint: Arc<dyn CheckpointLog>,
    replica: Arc<dyn ReplicaStore>,
    gateway: Arc<dyn ServerGateway>,
    conns: Mutex<ConnTables>,
    release_lock: Mutex<()>,
    vb_conns: Vec<Mutex<HashMap<VBucketId, Vec<WeakConnHandle>>>>,
    admission: Arc<BackfillAdmission>,
    backfills: Arc<BackfillManager>,
    min_compression_ratio: Arc<AtomicF32>,
    processor: Arc<CheckpointProcessorTask>,
    workers: Mutex<Vec<WorkerHandle>>,
}

impl std::fmt::Debug for DcpConnMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DcpConnMap")
            .field("connections", &self.conn_count())
            .field("dead_connections", &self.dead_conn_count())
            .finish_non_exhaustive()
    }
}

impl DcpConnMap {
    /// Creates the registry over the given collaborator seams.
    #[must_use]
    pub fn new(env: DcpEnvironment) -> Arc<Self> {
        let admission = Arc::new(BackfillAdmission::new(env.config.max_data_size));
        let backfills = Arc::new(BackfillManager::new(
            env.backfill_store,
            Arc::clone(&admission),
        ));
        let processor = Arc::new(CheckpointProcessorTask::new(
            env.config.producer_snapshot_marker_yield_limit,
        ));
        let vb_conns = (0..VB_CONN_STRIPES)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            min_compression_ratio: Arc::new(AtomicF32::new(env.config.min_compression_ratio)),
            config: env.config,
            checkpoint: env.checkpoint,
            replica: env.replica,
            gateway: env.gateway,
            conns: Mutex::new(ConnTables::default()),
            release_lock: Mutex::new(()),
            vb_conns,
            admission,
            backfills,
            processor,
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Spawns the background workers: processor pump, backfill pump, manage-tick sweep.
    pub fn start_workers(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if !workers.is_empty() {
            return;
        }
        let processor_worker = WorkerHandle::spawn(
            "reef-dcp-checkpoint-processor",
            Arc::clone(&self.processor) as Arc<dyn BackgroundTask>,
            None,
        );
        self.processor.attach_waker(processor_worker.waker());
        workers.push(processor_worker);

        let backfill_worker = WorkerHandle::spawn(
            "reef-dcp-backfill",
            Arc::clone(&self.backfills) as Arc<dyn BackgroundTask>,
            None,
        );
        self.backfills.attach_waker(backfill_worker.waker());
        workers.push(backfill_worker);

        let manager_task: Arc<dyn BackgroundTask> = Arc::new(ConnManagerTask {
            connmap: self.self_ref.clone(),
        });
        workers.push(WorkerHandle::spawn(
            "reef-dcp-conn-manager",
            manager_task,
            Some(MANAGE_MIN_PERIOD),
        ));
    }

    fn canonical_name(name: &str) -> String {
        format!("{CONN_NAME_PREFIX}{name}")
    }

    fn lock_conns(&self) -> std::sync::MutexGuard<'_, ConnTables> {
        self.conns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stripe(&self, vbucket: VBucketId) -> &Mutex<HashMap<VBucketId, Vec<WeakConnHandle>>> {
        &self.vb_conns[vbucket as usize % VB_CONN_STRIPES]
    }

    fn teardown_connection(&self, conn: &ConnHandle) {
        match conn {
            ConnHandle::Producer(producer) => {
                let _ = producer.close_all_streams();
                producer.clear_checkpoint_processor_queues();
            }
            ConnHandle::Consumer(consumer) => {
                // The drain worker stops before its streams close underneath it.
                consumer.cancel_task();
                let _ = consumer.close_all_streams();
            }
        }
    }

    /// Evicts any connection already holding this canonical name or cookie.
    fn evict_existing_locked(&self, tables: &mut ConnTables, cookie: Cookie, name: &str) {
        if let Some(position) = tables
            .all
            .iter()
            .position(|conn| conn.core().name() == name)
        {
            let old = tables.all.remove(position);
            tracing::warn!(
                name,
                old_cookie = old.core().cookie(),
                "evicting connection with duplicate name"
            );
            old.core().set_disconnect();
            let _ = tables.by_cookie.remove(&old.core().cookie());
            self.teardown_connection(&old);
            tables.dead.push_back(old);
        }
        if let Some(old) = tables.by_cookie.remove(&cookie) {
            tracing::warn!(cookie, "evicting connection with duplicate cookie");
            old.core().set_disconnect();
            tables.all.retain(|conn| conn.core().cookie() != cookie);
            self.teardown_connection(&old);
            tables.dead.push_back(old);
        }
    }

    /// Creates one consumer connection, evicting any holder of the same name or cookie.
    pub fn new_consumer(&self, cookie: Cookie, name: &str) -> Arc<DcpConsumer> {
        let conn_name = Self::canonical_name(name);
        let mut tables = self.lock_conns();
        self.evict_existing_locked(&mut tables, cookie, &conn_name);

        let consumer = DcpConsumer::new(
            cookie,
            conn_name,
            self.config.clone(),
            Arc::clone(&self.replica),
            Arc::clone(&self.gateway),
        );
        tracing::info!(name = consumer.core().name(), cookie, "connection created");
        tables.all.push(ConnHandle::Consumer(Arc::clone(&consumer)));
        let _ = tables
            .by_cookie
            .insert(cookie, ConnHandle::Consumer(Arc::clone(&consumer)));
        consumer
    }

    /// Creates one producer connection, evicting any holder of the same name or cookie.
    pub fn new_producer(&self, cookie: Cookie, name: &str, notify_only: bool) -> Arc<DcpProducer> {
        let conn_name = Self::canonical_name(name);
        let mut tables = self.lock_conns();
        self.evict_existing_locked(&mut tables, cookie, &conn_name);

        let producer = DcpProducer::new(
            cookie,
            conn_name,
            notify_only,
            self.config.clone(),
            Arc::clone(&self.checkpoint),
            Arc::clone(&self.processor),
            Arc::clone(&self.backfills),
            Arc::clone(&self.min_compression_ratio),
            Arc::clone(&self.gateway),
        );
        tracing::info!(name = producer.core().name(), cookie, "connection created");
        tables.all.push(ConnHandle::Producer(Arc::clone(&producer)));
        let _ = tables
            .by_cookie
            .insert(cookie, ConnHandle::Producer(Arc::clone(&producer)));
        producer
    }

    /// Opens one producer stream for the connection bound to `cookie`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Disconnect` when no producer is bound to the cookie, plus any
    /// stream-request error from the producer itself.
    pub fn stream_request(&self, cookie: Cookie, request: StreamRequest) -> EngineResult<()> {
        let producer = {
            let tables = self.lock_conns();
            tables
                .by_cookie
                .get(&cookie)
                .and_then(|conn| conn.as_producer().cloned())
        };
        let Some(producer) = producer else {
            return Err(EngineError::Disconnect);
        };
        producer.stream_request(request)?;

        let mut stripe = self
            .stripe(request.vbucket)
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        stripe
            .entry(request.vbucket)
            .or_default()
            .push(WeakConnHandle::Producer(Arc::downgrade(&producer)));
        Ok(())
    }

    /// Opens one passive stream, enforcing the one-stream-per-vbucket rule bucket-wide.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::KeyExists` when any consumer already holds a live passive stream
    /// for the vbucket, plus any add-stream error from the connection itself.
    pub fn add_passive_stream(
        &self,
        consumer: &Arc<DcpConsumer>,
        opaque: Opaque,
        vbucket: VBucketId,
        flags: StreamFlags,
    ) -> EngineResult<()> {
        {
            let tables = self.lock_conns();
            for conn in &tables.all {
                if let Some(existing) = conn.as_consumer()
                    && existing.is_stream_present(vbucket)
                {
                    tracing::warn!(
                        name = consumer.core().name(),
                        vbucket,
                        "rejecting passive stream, one already exists for the vbucket"
                    );
                    return Err(EngineError::KeyExists);
                }
            }
            consumer.add_stream(opaque, vbucket, flags)?;
        }

        let mut stripe = self
            .stripe(vbucket)
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        stripe
            .entry(vbucket)
            .or_default()
            .push(WeakConnHandle::Consumer(Arc::downgrade(consumer)));
        Ok(())
    }

    /// Evicts the first slow-candidate stream registered for `vbucket` under `name`.
    ///
    /// Touches only the vbucket's stripe lock; safe on hot paths.
    #[must_use]
    pub fn close_slow_stream(&self, vbucket: VBucketId, name: &str) -> bool {
        let stripe = self
            .stripe(vbucket)
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(conns) = stripe.get(&vbucket) else {
            return false;
        };
        for weak in conns {
            if let Some(ConnHandle::Producer(producer)) = weak.upgrade()
                && producer.close_slow_stream(vbucket, name)
            {
                return true;
            }
        }
        false
    }

    /// Disconnects the connection bound to `cookie`, tearing down its streams synchronously.
    pub fn disconnect(&self, cookie: Cookie) {
        let mut tables = self.lock_conns();
        let from_all = tables
            .all
            .iter()
            .position(|conn| conn.core().cookie() == cookie)
            .map(|position| tables.all.remove(position));
        if let Some(conn) = &from_all {
            conn.core().set_disconnect();
        }

        match tables.by_cookie.remove(&cookie) {
            Some(conn) => {
                tracing::info!(name = conn.core().name(), "removing connection");
                conn.core().set_disconnect();
                self.teardown_connection(&conn);
                tables.dead.push_back(conn);
            }
            None => {
                if let Some(conn) = from_all {
                    // A list entry without a cookie mapping would otherwise leak.
                    tracing::warn!(
                        name = conn.core().name(),
                        "repairing connection missing from the cookie table"
                    );
                    self.teardown_connection(&conn);
                    tables.dead.push_back(conn);
                }
            }
        }
    }

    /// Fans one vbucket state change into every producer (and consumer, when requested).
    pub fn vbucket_state_changed(
        &self,
        vbucket: VBucketId,
        state: VBucketState,
        close_inbound_streams: bool,
    ) {
        let tables = self.lock_conns();
        for conn in &tables.all {
            match conn {
                ConnHandle::Producer(producer) => producer.vbucket_state_changed(vbucket, state),
                ConnHandle::Consumer(consumer) => {
                    if close_inbound_streams {
                        consumer.vbucket_state_changed(vbucket, state);
                    }
                }
            }
        }
    }

    /// Hot path: fans one seqno-available notification into the vbucket's producers.
    ///
    /// Takes only the vbucket's stripe lock, never the registry mutex.
    pub fn notify_vb_connections(&self, vbucket: VBucketId, by_seqno: u64) {
        let stripe = self
            .stripe(vbucket)
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(conns) = stripe.get(&vbucket) else {
            return;
        };
        for weak in conns {
            if let Some(ConnHandle::Producer(producer)) = weak.upgrade() {
                producer.notify_seqno_available(vbucket, by_seqno);
            }
        }
    }

    /// Wakes the backfill machinery so bounded buffers drain promptly.
    pub fn notify_backfill_manager_tasks(&self) {
        self.backfills.wake();
    }

    /// Updates the process-wide minimum compression ratio for producers.
    pub fn update_min_compression_ratio(&self, value: f32) {
        self.min_compression_ratio.store(value, Ordering::Release);
    }

    /// Current minimum compression ratio for producers.
    #[must_use]
    pub fn min_compression_ratio(&self) -> f32 {
        self.min_compression_ratio.load(Ordering::Acquire)
    }

    /// Recomputes the backfill admission cap after a quota change.
    pub fn update_max_active_snoozing_backfills(&self, max_data_size: u64) {
        self.admission
            .update_max_active_snoozing_backfills(max_data_size);
    }

    /// Shared backfill admission counters.
    #[must_use]
    pub fn admission(&self) -> &Arc<BackfillAdmission> {
        &self.admission
    }

    /// Shared checkpoint processor task.
    #[must_use]
    pub fn processor(&self) -> &Arc<CheckpointProcessorTask> {
        &self.processor
    }

    /// Shared backfill manager.
    #[must_use]
    pub fn backfills(&self) -> &Arc<BackfillManager> {
        &self.backfills
    }

    /// Stops workers, closes every stream, and releases every connection, in that order.
    pub fn shutdown_all_connections(&self) {
        tracing::warn!("shutting down dcp connections");

        let workers = {
            let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            workers.drain(..).collect::<Vec<_>>()
        };
        for mut worker in workers {
            worker.shutdown();
        }

        let to_release = {
            let mut tables = self.lock_conns();
            for conn in &tables.all {
                conn.core().set_disconnect();
                self.teardown_connection(conn);
            }
            self.processor.clear();

            let mut to_release = tables.all.drain(..).collect::<Vec<_>>();
            for dead in tables.dead.drain(..) {
                if !to_release
                    .iter()
                    .any(|conn| conn.core().cookie() == dead.core().cookie())
                {
                    to_release.push(dead);
                }
            }
            tables.by_cookie.clear();
            to_release
        };

        {
            let _release_guard = self
                .release_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for conn in &to_release {
                tracing::info!(name = conn.core().name(), "cleaning up connection");
                self.gateway.release_reference(conn.core().cookie());
                conn.core().set_reserved(false);
                self.remove_vb_connections(conn);
            }
        }

        // Dead connections are otherwise reclaimed on the 2s sweep; a bucket delete cannot
        // wait for that, so run one final sweep here.
        self.manage_connections();
    }

    /// Periodic sweep: reclaims dead connections and re-notifies paused reserved ones.
    pub fn manage_connections(&self) {
        let (release, notify) = {
            let mut tables = self.lock_conns();
            let release = tables.dead.drain(..).collect::<Vec<_>>();
            for conn in &release {
                tracing::warn!(name = conn.core().name(), "reclaiming dead connection");
            }

            let now = unix_secs_now();
            let mut notify = Vec::new();
            for conn in &tables.all {
                let core = conn.core();
                if (core.is_paused() || core.do_disconnect())
                    && core.is_reserved()
                    && (!core.notify_sent() || core.last_walk_time_secs() + NOTIFY_IDLE_SECS < now)
                {
                    notify.push(conn.clone());
                }
            }
            (release, notify)
        };

        let _release_guard = self
            .release_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for conn in &notify {
            if conn.core().is_reserved() {
                self.gateway
                    .notify_io_complete(conn.core().cookie(), Ok(()));
                conn.core().set_notify_sent(true);
                conn.core().touch_last_walk_time();
            }
        }
        for conn in &release {
            self.gateway.release_reference(conn.core().cookie());
            conn.core().set_reserved(false);
            self.remove_vb_connections(conn);
        }
    }

    /// Erases one released connection from the per-vbucket index, stripe by stripe.
    fn remove_vb_connections(&self, conn: &ConnHandle) {
        let vbuckets = match conn {
            ConnHandle::Producer(producer) => producer.vb_vector(),
            ConnHandle::Consumer(consumer) => consumer.vb_vector(),
        };
        let cookie = conn.core().cookie();
        for vbucket in vbuckets {
            let mut stripe = self
                .stripe(vbucket)
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let mut remove_entry = false;
            if let Some(conns) = stripe.get_mut(&vbucket) {
                conns.retain(|weak| {
                    weak.upgrade()
                        .is_some_and(|other| other.core().cookie() != cookie)
                });
                remove_entry = conns.is_empty();
            }
            if remove_entry {
                let _ = stripe.remove(&vbucket);
            }
        }
    }

    /// Live connection count.
    #[must_use]
    pub fn conn_count(&self) -> usize {
        self.lock_conns().all.len()
    }

    /// Connections awaiting release by the next sweep.
    #[must_use]
    pub fn dead_conn_count(&self) -> usize {
        self.lock_conns().dead.len()
    }

    /// Returns the connection bound to one cookie, if any.
    #[must_use]
    pub fn find_by_cookie(&self, cookie: Cookie) -> Option<ConnHandle> {
        self.lock_conns().by_cookie.get(&cookie).cloned()
    }

    /// Connections currently registered in the vbucket index for `vbucket`.
    #[must_use]
    pub fn vb_conn_count(&self, vbucket: VBucketId) -> usize {
        let stripe = self
            .stripe(vbucket)
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        stripe.get(&vbucket).map_or(0, Vec::len)
    }

    /// Appends registry and per-connection stats rows.
    pub fn append_stats(&self, out: &mut Vec<(String, String)>) {
        let conns = {
            let tables = self.lock_conns();
            out.push((
                "ep_dcp_dead_conn_count".to_owned(),
                tables.dead.len().to_string(),
            ));
            tables.all.clone()
        };
        for conn in conns {
            conn.append_stats(out);
        }
    }
}

/// Periodic sweep task wrapping [`DcpConnMap::manage_connections`].
struct ConnManagerTask {
    connmap: Weak<DcpConnMap>,
}

impl BackgroundTask for ConnManagerTask {
    fn run_once(&self) -> TaskAction {
        let Some(connmap) = self.connmap.upgrade() else {
            return TaskAction::Complete;
        };
        connmap.manage_connections();
        TaskAction::Sleep
    }

    fn description(&self) -> &'static str {
        "Manage DCP connections"
    }
}

#[cfg(test)]
mod connmap_tests;
