//! Producer-side stream that only signals seqno availability.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use reef_common::ids::{Opaque, Seqno};

use crate::connection::DcpProducer;
use crate::message::{DcpMessage, EndStreamStatus};
use crate::ready_queue::ReadyQueue;
use crate::stream::{StreamCore, StreamRequest, StreamState};

/// Carries no items; ends itself once the requested end seqno becomes reachable.
#[derive(Debug)]
pub struct NotifierStream {
    core: StreamCore,
    producer: Weak<DcpProducer>,
    ready: Mutex<ReadyQueue>,
}

impl NotifierStream {
    /// Creates one notifier stream bound to a producer connection.
    #[must_use]
    pub fn new(name: String, request: &StreamRequest, producer: Weak<DcpProducer>) -> Arc<Self> {
        let ready = ReadyQueue::new();
        let core = StreamCore::new(name, request, StreamState::InMemory, ready.bytes_handle());
        Arc::new(Self {
            core,
            producer,
            ready: Mutex::new(ready),
        })
    }

    /// Shared identity/bookkeeping record.
    #[must_use]
    pub fn core(&self) -> &StreamCore {
        &self.core
    }

    fn lock_ready(&self) -> std::sync::MutexGuard<'_, ReadyQueue> {
        self.ready.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pulls the pending stream-end message once the watched seqno was reached.
    #[must_use]
    pub fn next(&self) -> Option<DcpMessage> {
        let mut ready = self.lock_ready();
        let message = ready.pop();
        if message.is_none() {
            self.core.set_items_ready(false);
        }
        message
    }

    /// Signals one newly available seqno; ends the stream once the window is reachable.
    pub fn notify_seqno_available(&self, seqno: Seqno) {
        let notify = {
            let mut ready = self.lock_ready();
            if !self.core.is_active() || seqno < self.core.end_seqno() {
                false
            } else {
                ready.push(DcpMessage::StreamEnd {
                    opaque: self.core.opaque(),
                    vbucket: self.core.vbucket(),
                    status: EndStreamStatus::Ok,
                });
                self.core.set_state(StreamState::Dead);
                self.core.set_items_ready(true);
                true
            }
        };
        if notify
            && let Some(producer) = self.producer.upgrade()
        {
            producer.notify_stream_ready(self.core.vbucket());
        }
    }

    /// Terminates the stream without queueing a message; idempotent.
    pub fn set_dead(&self, _status: EndStreamStatus) -> Opaque {
        let _ready = self.lock_ready();
        if self.core.is_active() {
            self.core.set_state(StreamState::Dead);
        }
        self.core.opaque()
    }

    /// Drops and frees all pending ready-queue messages.
    pub fn clear(&self) {
        let mut ready = self.lock_ready();
        ready.clear();
    }

    /// Appends per-stream stats rows.
    pub fn append_stats(&self, out: &mut Vec<(String, String)>) {
        let prefix = format!("{}:stream_{}", self.core.name(), self.core.vbucket());
        out.push((
            format!("{prefix}:state"),
            self.core.state().as_label().to_owned(),
        ));
        out.push((
            format!("{prefix}:ready_queue_bytes"),
            self.core.ready_queue_bytes().to_string(),
        ));
        out.push((
            format!("{prefix}:end_seqno"),
            self.core.end_seqno().to_string(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::NotifierStream;
    use crate::message::DcpMessage;
    use crate::stream::{StreamRequest, StreamState};
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Weak;

    fn notifier_watching(end_seqno: u64) -> std::sync::Arc<NotifierStream> {
        NotifierStream::new(
            "eq_dcpq:notifier".to_owned(),
            &StreamRequest {
                flags: 0,
                opaque: 21,
                vbucket: 9,
                start_seqno: 0,
                end_seqno,
                vb_uuid: 0,
                snap_start_seqno: 0,
                snap_end_seqno: 0,
            },
            Weak::new(),
        )
    }

    #[rstest]
    fn stays_active_below_watched_seqno() {
        let stream = notifier_watching(50);

        stream.notify_seqno_available(49);
        assert_that!(stream.core().is_active(), eq(true));
        assert_that!(stream.next().is_none(), eq(true));
    }

    #[rstest]
    fn ends_once_watched_seqno_is_reachable() {
        let stream = notifier_watching(50);

        stream.notify_seqno_available(50);
        assert_that!(stream.core().state(), eq(StreamState::Dead));
        let Some(DcpMessage::StreamEnd { .. }) = stream.next() else {
            panic!("a reachable end seqno must queue one stream-end message");
        };
        assert_that!(stream.next().is_none(), eq(true));
    }

    #[rstest]
    fn dead_notifier_ignores_further_seqnos() {
        let stream = notifier_watching(50);
        stream.notify_seqno_available(50);
        let _ = stream.next();

        stream.notify_seqno_available(60);
        assert_that!(stream.next().is_none(), eq(true));
    }
}
