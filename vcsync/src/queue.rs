//! Batches local version updates and applies them to the local version table
//! and/or the server in one transaction per flush.
use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use vcsync_core::{
    client::{Transport, TransportError},
    types::{BaselineId, ItemId},
    update::LocalVersionUpdate,
};

use crate::{
    baseline::BaselineCache,
    context::Context,
    state::{
        apply::{acknowledge, apply_updates, BaselineRequest},
        with_local_version_table, TableError,
    },
};

/// How long a producer waits on a full queue before checking if anybody
/// is flushing it
const FULL_QUEUE_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("Unable to send local version updates: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOptions {
    UpdateLocal,
    UpdateServer,
    UpdateBoth,
}

impl QueueOptions {
    pub fn updates_local(&self) -> bool {
        matches!(self, QueueOptions::UpdateLocal | QueueOptions::UpdateBoth)
    }

    pub fn updates_server(&self) -> bool {
        matches!(self, QueueOptions::UpdateServer | QueueOptions::UpdateBoth)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueThresholds {
    pub flush_trigger: usize,
    pub max_level: usize,
    pub time_trigger: Option<Duration>,
}

impl QueueThresholds {
    pub fn from_context(context: &Context) -> Self {
        Self {
            flush_trigger: context.config.queue_flush_trigger,
            max_level: context.config.queue_max_level,
            time_trigger: Some(context.config.queue_time_trigger),
        }
    }

    /// Bulk acknowledgement queue: big batches, no time trigger
    pub fn remap(context: &Context) -> Self {
        Self {
            flush_trigger: context.config.remap_flush_trigger,
            max_level: context.config.remap_max_level,
            time_trigger: None,
        }
    }
}

struct Pending {
    updates: Vec<LocalVersionUpdate>,
    closed: bool,
    flushing: bool,
    timer: Instant,
}

#[derive(Default)]
struct Flushed {
    pending_acks: Vec<LocalVersionUpdate>,
    displaced_baselines: HashSet<BaselineId>,
}

pub struct UpdateLocalVersionQueue {
    context: Context,
    transport: Arc<dyn Transport>,
    baselines: Arc<BaselineCache>,
    options: QueueOptions,
    thresholds: QueueThresholds,
    pending: Mutex<Pending>,
    not_full: Condvar,
    flush_lock: Mutex<Flushed>,
}

impl UpdateLocalVersionQueue {
    pub fn new(
        context: Context,
        transport: Arc<dyn Transport>,
        baselines: Arc<BaselineCache>,
        options: QueueOptions,
        thresholds: QueueThresholds,
    ) -> Self {
        Self {
            context,
            transport,
            baselines,
            options,
            thresholds,
            pending: Mutex::new(Pending {
                updates: Vec::with_capacity(thresholds.max_level),
                closed: false,
                flushing: false,
                timer: Instant::now(),
            }),
            not_full: Condvar::new(),
            flush_lock: Mutex::new(Flushed::default()),
        }
    }

    fn writes_local_table(&self) -> bool {
        self.context.is_local() && self.options.updates_local()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffer an update, flushing when a threshold is reached. Blocks while
    /// the queue is full and being flushed by another thread.
    pub fn queue(&self, update: LocalVersionUpdate) -> Result<(), QueueError> {
        if !self.context.is_local() && !update.is_send_to_server() {
            return Ok(());
        }
        if !self.context.is_local() && update.item_id() == Some(ItemId(0)) {
            log::warn!(
                "[{}] Ignore update of {} without item id in a server workspace",
                self.context.workspace_name,
                update.server_item()
            );
            return Ok(());
        }

        let flush = {
            let mut pending = self.pending.lock();
            let mut timed_out = false;
            while pending.updates.len() >= self.thresholds.max_level {
                if timed_out && !pending.flushing {
                    break;
                }
                timed_out = self
                    .not_full
                    .wait_for(&mut pending, FULL_QUEUE_WAIT)
                    .timed_out();
            }

            if pending.closed {
                log::debug!(
                    "[{}] Ignore update of {} queued after close",
                    self.context.workspace_name,
                    update.server_item()
                );
                return Ok(());
            }

            if pending.updates.is_empty() {
                pending.timer = Instant::now();
            }
            pending.updates.push(update);

            let time_elapsed = self
                .thresholds
                .time_trigger
                .map_or(false, |trigger| pending.timer.elapsed() >= trigger);
            if !pending.flushing
                && (pending.updates.len() >= self.thresholds.flush_trigger || time_elapsed)
            {
                pending.flushing = true;
                pending.timer = Instant::now();
                true
            } else {
                false
            }
        };

        if flush {
            let result = self.flush();
            self.pending.lock().flushing = false;
            result?;
        }

        Ok(())
    }

    /// Durably apply every buffered update before returning
    pub fn flush(&self) -> Result<(), QueueError> {
        let mut flushed = self.flush_lock.lock();
        let updates: Vec<LocalVersionUpdate> = self.pending.lock().updates.clone();

        let result = self.send(&mut flushed, &updates);

        {
            let mut pending = self.pending.lock();
            pending.updates.drain(..updates.len());
            self.not_full.notify_all();
        }

        let requests = result?;
        self.download_missing_baselines(requests);
        Ok(())
    }

    fn send(
        &self,
        flushed: &mut Flushed,
        updates: &[LocalVersionUpdate],
    ) -> Result<Vec<BaselineRequest>, QueueError> {
        if updates.is_empty() {
            return Ok(vec![]);
        }
        log::debug!(
            "[{}] Flush {} local version updates ({:?})",
            self.context.workspace_name,
            updates.len(),
            self.options
        );

        let mut requests = vec![];
        if self.writes_local_table() {
            let acks = std::mem::take(&mut flushed.pending_acks);
            let displaced = &mut flushed.displaced_baselines;
            let baselines = &self.baselines;
            let root = &self.context.root;
            requests = with_local_version_table(&self.context, |table| {
                baselines.maintain(table, root)?;
                if !acks.is_empty() {
                    acknowledge(table, &acks)?;
                }
                apply_updates(table, baselines, updates, displaced)
            })?;
        }

        if self.options.updates_server() {
            let to_server: Vec<LocalVersionUpdate> = updates
                .iter()
                .filter(|update| update.is_send_to_server())
                .cloned()
                .collect();
            if !to_server.is_empty() {
                self.transport
                    .update_local_version(&self.context.workspace_name, &to_server)?;
            }
            if self.writes_local_table() {
                flushed.pending_acks.extend(to_server);
            }
        }

        Ok(requests)
    }

    /// Fetch content of baselines assigned while applying updates. Failures
    /// leave the row flagged as missing its baseline.
    fn download_missing_baselines(&self, requests: Vec<BaselineRequest>) {
        if requests.is_empty() || !self.options.updates_server() {
            return;
        }

        let mut fetched = vec![];
        for request in requests {
            let location = match self
                .baselines
                .new_baseline_location(&request.baseline_id, request.target_local_item.as_deref())
            {
                Ok(location) => location,
                Err(error) => {
                    log::warn!(
                        "[{}] Unable to prepare baseline of {}: {}",
                        self.context.workspace_name,
                        request.server_item,
                        error
                    );
                    continue;
                }
            };

            match self.transport.download(&request.download_url, &location) {
                Ok(_) => fetched.push(request),
                Err(error) => {
                    log::warn!(
                        "[{}] Unable to download baseline of {}: {}",
                        self.context.workspace_name,
                        request.server_item,
                        error
                    );
                    self.baselines.delete_baseline(&request.baseline_id);
                }
            }
        }

        if fetched.is_empty() {
            return;
        }
        if let Err(error) = with_local_version_table(&self.context, |table| {
            for request in &fetched {
                table.set_missing_baseline(&request.server_item, request.committed, false)?;
            }
            Ok(())
        }) {
            log::warn!(
                "[{}] Unable to record downloaded baselines: {}",
                self.context.workspace_name,
                error
            );
        }
    }

    fn flush_acks(&self) -> Result<(), QueueError> {
        if self.options != QueueOptions::UpdateBoth || !self.context.is_local() {
            return Ok(());
        }

        let acks = std::mem::take(&mut self.flush_lock.lock().pending_acks);
        if !acks.is_empty() {
            with_local_version_table(&self.context, |table| acknowledge(table, &acks))?;
        }
        Ok(())
    }

    /// Flush, acknowledge what the server received and drop baselines of
    /// displaced rows nobody re-used. Updates queued after this are ignored.
    pub fn close(&self) -> Result<(), QueueError> {
        self.pending.lock().closed = true;

        self.flush()?;
        self.flush_acks()?;

        let displaced = std::mem::take(&mut self.flush_lock.lock().displaced_baselines);
        for baseline_id in displaced {
            self.baselines.delete_baseline(&baseline_id);
        }
        Ok(())
    }
}
