#![forbid(unsafe_code)]

//! Fan-out of job events to every live subscriber.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{
    error::{JobError, JobResult},
    jobs::JobId,
};

/// Events pushed over the notification channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum JobEvent {
    #[serde(rename_all = "camelCase")]
    Progress { job_id: JobId, percent: u8 },
    #[serde(rename_all = "camelCase")]
    Completion {
        job_id: JobId,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Progress { job_id, .. } | Self::Completion { job_id, .. } => *job_id,
        }
    }
}

/// One subscriber. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn is_open(&self) -> bool;
    fn send(&self, event: &JobEvent) -> JobResult<()>;
}

/// Events a subscriber may have queued before further events are dropped.
pub const SUBSCRIBER_BUFFER: usize = 256;

/// Sink backed by a bounded channel drained by the connection task. It counts
/// as open for as long as that task holds the receiver. A subscriber whose
/// queue is full misses events instead of growing it.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<JobEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<JobEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    fn send(&self, event: &JobEvent) -> JobResult<()> {
        self.tx.try_send(event.clone()).map_err(|err| match err {
            TrySendError::Full(_) => JobError::Delivery("subscriber is lagging".into()),
            TrySendError::Closed(_) => JobError::Delivery("subscriber went away".into()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(u64);

/// Owns the set of active connections. Membership changes only through
/// `register`/`unregister`; a closed sink is skipped, never evicted.
#[derive(Default)]
pub struct NotificationHub {
    connections: RwLock<HashMap<ConnectionHandle, Arc<dyn EventSink>>>,
    next_id: AtomicU64,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sink: Arc<dyn EventSink>) -> ConnectionHandle {
        let handle = ConnectionHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.connections.write().insert(handle, sink);
        tracing::debug!(connection = handle.0, "client connected");
        handle
    }

    /// Removing an unknown or already removed handle is a no-op.
    pub fn unregister(&self, handle: ConnectionHandle) {
        if self.connections.write().remove(&handle).is_some() {
            tracing::debug!(connection = handle.0, "client disconnected");
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn broadcast_progress(&self, job_id: JobId, percent: u8) {
        self.broadcast(&JobEvent::Progress { job_id, percent });
    }

    pub fn broadcast_completion(
        &self,
        job_id: JobId,
        success: bool,
        error_message: Option<String>,
    ) {
        self.broadcast(&JobEvent::Completion {
            job_id,
            success,
            error_message,
        });
    }

    /// Returns how many sinks accepted the event.
    pub fn broadcast(&self, event: &JobEvent) -> usize {
        let sinks: Vec<(ConnectionHandle, Arc<dyn EventSink>)> = self
            .connections
            .read()
            .iter()
            .map(|(handle, sink)| (*handle, sink.clone()))
            .collect();

        let mut delivered = 0;
        for (handle, sink) in sinks {
            if !sink.is_open() {
                continue;
            }
            match sink.send(event) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::warn!(
                        connection = handle.0,
                        job = %event.job_id(),
                        error = %err,
                        "dropping event for client"
                    );
                }
            }
        }
        delivered
    }
}
