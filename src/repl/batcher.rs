//! The batcher thread.
//!
//! A single consumer drains the oplog buffer into bounded batches and
//! publishes them through a one-slot hand-off: the next batch is not
//! assembled past the slot until the apply loop takes the previous one.
//! A batch ends on buffer exhaustion, the byte/op limits, the delayed-
//! apply cutoff, or an entry that must apply in isolation.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use crate::config::ApplyConfig;
use crate::core::{OpEntry, OpQueue, OPLOG_VERSION};
use crate::error::fatal;
use crate::util::ShutdownSignal;

use super::buffer::OplogBuffer;
use super::coordinator::ReplicationCoordinator;

/// Limits a single batch must respect.
#[derive(Clone, Debug)]
pub struct BatchLimits {
    pub max_ops: usize,
    pub max_bytes: usize,
    /// Entries at or after this wall-clock cutoff wait for the clock.
    pub slave_delay_latest: Option<SystemTime>,
}

impl BatchLimits {
    pub fn from_config(config: &ApplyConfig) -> Self {
        Self {
            max_ops: config.batch_max_ops,
            max_bytes: config.batch_max_bytes,
            slave_delay_latest: None,
        }
    }
}

pub(crate) struct BatcherContext {
    pub buffer: Arc<OplogBuffer>,
    pub coordinator: Arc<dyn ReplicationCoordinator>,
    pub config: ApplyConfig,
    pub shutdown: ShutdownSignal,
}

struct Slot {
    queue: Mutex<Option<OpQueue>>,
    cond: Condvar,
}

pub struct Batcher {
    slot: Arc<Slot>,
    thread: Option<JoinHandle<()>>,
}

impl Batcher {
    pub(crate) fn spawn(ctx: BatcherContext) -> Self {
        let slot = Arc::new(Slot {
            queue: Mutex::new(None),
            cond: Condvar::new(),
        });
        let thread_slot = Arc::clone(&slot);
        let thread = std::thread::Builder::new()
            .name("repl-batcher".into())
            .spawn(move || run(ctx, thread_slot))
            .expect("spawn batcher");
        Self {
            slot,
            thread: Some(thread),
        }
    }

    /// Take the next batch, waiting up to `max_wait`. An empty queue on
    /// return means the wait timed out (or the shutdown sentinel, when its
    /// flag is set).
    pub fn next_batch(&self, max_wait: Duration) -> OpQueue {
        let mut queue = self.slot.queue.lock().expect("batcher slot poisoned");
        if queue.is_none() {
            // Whether this wakes by signal or timeout does not matter; we
            // return whatever is in the slot either way.
            let (waited, _) = self
                .slot
                .cond
                .wait_timeout(queue, max_wait)
                .expect("batcher slot poisoned");
            queue = waited;
        }
        let out = queue.take().unwrap_or_default();
        self.slot.cond.notify_all();
        out
    }

    /// The batcher exits once it has published the shutdown sentinel; join
    /// after draining.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run(ctx: BatcherContext, slot: Arc<Slot>) {
    loop {
        let mut limits = BatchLimits::from_config(&ctx.config);
        let slave_delay = ctx.coordinator.slave_delay();
        if !slave_delay.is_zero() {
            limits.slave_delay_latest = SystemTime::now().checked_sub(slave_delay);
        }

        let mut ops = OpQueue::new();
        while !collect_until_boundary(&ctx, &mut ops, &limits) {}

        if ops.is_empty() && !ops.must_shutdown() {
            continue; // Never publish empty batches.
        }
        let dying = ops.must_shutdown();

        let mut queue = slot.queue.lock().expect("batcher slot poisoned");
        while queue.is_some() {
            queue = slot.cond.wait(queue).expect("batcher slot poisoned");
        }
        *queue = Some(ops);
        slot.cond.notify_all();
        if dying {
            return;
        }
    }
}

/// Pull at most one entry into `ops`. Returns true when the batch must end
/// (with or without the peeked entry).
pub(crate) fn collect_until_boundary(
    ctx: &BatcherContext,
    ops: &mut OpQueue,
    limits: &BatchLimits,
) -> bool {
    let Some(raw) = ctx.buffer.peek() else {
        if ops.is_empty() {
            if ctx.shutdown.is_set() {
                ops.set_must_shutdown();
            } else {
                // Block briefly; either way the caller re-checks so
                // shutdown and reconfiguration stay responsive.
                ctx.buffer.wait_for_data(Duration::from_secs(1));
            }
        }
        return true;
    };

    // A single oversized entry still forms a batch of one.
    if !ops.is_empty() && ops.bytes() + raw.len() > limits.max_bytes {
        return true;
    }

    let entry = match OpEntry::parse(raw) {
        Ok(entry) => entry,
        Err(err) => fatal(21235, format!("unparseable log entry: {err}")),
    };

    if entry.version() != OPLOG_VERSION {
        fatal(
            18820,
            format!(
                "expected log version {OPLOG_VERSION} but found {} in entry at {}",
                entry.version(),
                entry.optime()
            ),
        );
    }

    if let Some(latest) = limits.slave_delay_latest {
        let entry_date = entry.timestamp().as_wall_time();
        if entry_date >= latest {
            // Not this entry's time yet. Sleep only when idle so a batch
            // in progress is published promptly.
            if ops.is_empty() {
                std::thread::sleep(Duration::from_secs(1));
            }
            return true;
        }
    }

    // Commands apply one at a time. The exceptions expand to plain CRUD:
    // unprepared applyOps and unprepared commits batch freely. Entries on
    // system.views and the server-configuration document are isolated too,
    // the former because the view catalog reflects each entry immediately,
    // the latter so the compatibility version seen while applying matches
    // the primary's at commit time.
    let must_isolate = (entry.is_command()
        && !entry.is_unprepared_commit()
        && !entry.is_unprepared_apply_ops())
        || entry.ns().is_system_dot_views()
        || entry.ns().is_server_configuration();
    if must_isolate {
        if ops.is_empty() {
            consume(ctx);
            ops.push(entry);
        }
        // Otherwise leave it in the buffer to start its own batch.
        return true;
    }

    consume(ctx);
    ops.push(entry);
    ops.len() >= limits.max_ops
}

fn consume(ctx: &BatcherContext) {
    // The entry was peeked and admitted; the only way the pop can miss is
    // a concurrent shutdown clearing the buffer.
    let popped = ctx.buffer.try_pop();
    debug_assert!(popped.is_some() || ctx.shutdown.is_set());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Document;
    use crate::repl::coordinator::LocalCoordinator;
    use bytes::Bytes;
    use serde_json::json;

    fn raw_entry(value: serde_json::Value) -> Bytes {
        Document(value.as_object().expect("object").clone()).to_bytes()
    }

    fn raw_insert(secs: u32, ns: &str) -> Bytes {
        raw_entry(json!({
            "ts": {"secs": secs, "inc": 0},
            "t": 1,
            "v": 2,
            "op": "i",
            "ns": ns,
            "o": {"_id": secs},
            "wall": u64::from(secs) * 1000,
        }))
    }

    fn test_ctx(buffer: Arc<OplogBuffer>) -> BatcherContext {
        BatcherContext {
            buffer,
            coordinator: Arc::new(LocalCoordinator::recovering()),
            config: ApplyConfig::default(),
            shutdown: ShutdownSignal::new(),
        }
    }

    fn drain(ctx: &BatcherContext, limits: &BatchLimits) -> OpQueue {
        let mut ops = OpQueue::new();
        while !collect_until_boundary(ctx, &mut ops, limits) {}
        ops
    }

    #[test]
    fn batches_crud_until_op_limit() {
        let buffer = Arc::new(OplogBuffer::new(1 << 20));
        for secs in 1..=10 {
            buffer.push(raw_insert(secs, "app.events"));
        }
        let ctx = test_ctx(Arc::clone(&buffer));
        let limits = BatchLimits {
            max_ops: 4,
            max_bytes: 1 << 20,
            slave_delay_latest: None,
        };
        let ops = drain(&ctx, &limits);
        assert_eq!(ops.len(), 4);
        assert_eq!(buffer.len(), 6);
    }

    #[test]
    fn oversized_single_entry_forms_batch_of_one() {
        let buffer = Arc::new(OplogBuffer::new(1 << 20));
        buffer.push(raw_entry(json!({
            "ts": {"secs": 1, "inc": 0},
            "t": 1,
            "v": 2,
            "op": "i",
            "ns": "app.events",
            "o": {"_id": 1, "blob": "x".repeat(4096)},
            "wall": 0,
        })));
        buffer.push(raw_insert(2, "app.events"));
        let ctx = test_ctx(Arc::clone(&buffer));
        let limits = BatchLimits {
            max_ops: 100,
            max_bytes: 64, // far below the first entry's size
            slave_delay_latest: None,
        };
        let ops = drain(&ctx, &limits);
        assert_eq!(ops.len(), 1, "oversized entry applies alone");
        assert!(ops.bytes() > limits.max_bytes);

        let ops = drain(&ctx, &limits);
        assert_eq!(ops.len(), 1, "next entry starts the next batch");
    }

    #[test]
    fn commands_are_isolated_but_containers_batch_freely() {
        let buffer = Arc::new(OplogBuffer::new(1 << 20));
        buffer.push(raw_insert(1, "app.events"));
        buffer.push(raw_entry(json!({
            "ts": {"secs": 2, "inc": 0},
            "t": 1,
            "v": 2,
            "op": "c",
            "ns": "app.$cmd",
            "o": {"create": "fresh"},
            "wall": 0,
        })));
        buffer.push(raw_insert(3, "app.events"));
        let ctx = test_ctx(Arc::clone(&buffer));
        let limits = BatchLimits {
            max_ops: 100,
            max_bytes: 1 << 20,
            slave_delay_latest: None,
        };

        let first = drain(&ctx, &limits);
        assert_eq!(first.len(), 1, "batch ends before the command");

        let second = drain(&ctx, &limits);
        assert_eq!(second.len(), 1, "the command applies alone");
        assert!(second.front().expect("entry").is_command());

        // An unprepared applyOps is a CRUD container and batches freely.
        buffer.push(raw_entry(json!({
            "ts": {"secs": 4, "inc": 0},
            "t": 1,
            "v": 2,
            "op": "c",
            "ns": "admin.$cmd",
            "o": {"applyOps": [{"op": "i", "ns": "app.events", "o": {"_id": 40}}]},
            "wall": 0,
        })));
        let third = drain(&ctx, &limits);
        assert_eq!(third.len(), 2, "insert plus container batch together");
    }

    #[test]
    fn system_views_entries_are_isolated() {
        let buffer = Arc::new(OplogBuffer::new(1 << 20));
        buffer.push(raw_insert(1, "app.events"));
        buffer.push(raw_insert(2, "app.system.views"));
        let ctx = test_ctx(Arc::clone(&buffer));
        let limits = BatchLimits {
            max_ops: 100,
            max_bytes: 1 << 20,
            slave_delay_latest: None,
        };
        let first = drain(&ctx, &limits);
        assert_eq!(first.len(), 1);
        let second = drain(&ctx, &limits);
        assert_eq!(second.len(), 1);
        assert!(second.front().expect("entry").ns().is_system_dot_views());
    }

    #[test]
    fn delayed_entries_wait_for_the_clock() {
        let buffer = Arc::new(OplogBuffer::new(1 << 20));
        let now_secs = SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_secs() as u32;
        buffer.push(raw_insert(now_secs - 100, "app.events"));
        buffer.push(raw_insert(now_secs - 10, "app.events"));
        let ctx = test_ctx(Arc::clone(&buffer));
        let limits = BatchLimits {
            max_ops: 100,
            max_bytes: 1 << 20,
            // Cutoff 60s ago: the second entry is too fresh.
            slave_delay_latest: Some(SystemTime::now() - Duration::from_secs(60)),
        };
        let ops = drain(&ctx, &limits);
        assert_eq!(ops.len(), 1);
        assert_eq!(buffer.len(), 1, "fresh entry stays buffered");
    }

    #[test]
    fn entry_exactly_at_the_cutoff_is_delayed() {
        let buffer = Arc::new(OplogBuffer::new(1 << 20));
        let cutoff_secs = 1_700_000_000u32;
        buffer.push(raw_insert(cutoff_secs, "app.events"));
        let ctx = test_ctx(Arc::clone(&buffer));
        let limits = BatchLimits {
            max_ops: 100,
            max_bytes: 1 << 20,
            slave_delay_latest: Some(
                std::time::UNIX_EPOCH + Duration::from_secs(u64::from(cutoff_secs)),
            ),
        };
        let ops = drain(&ctx, &limits);
        assert!(ops.is_empty(), "boundary entry must wait for the clock");
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn shutdown_produces_the_sentinel() {
        let buffer = Arc::new(OplogBuffer::new(1 << 20));
        let ctx = test_ctx(Arc::clone(&buffer));
        ctx.shutdown.set();
        let limits = BatchLimits {
            max_ops: 100,
            max_bytes: 1 << 20,
            slave_delay_latest: None,
        };
        let ops = drain(&ctx, &limits);
        assert!(ops.is_empty());
        assert!(ops.must_shutdown());
    }

    #[test]
    fn spawned_batcher_publishes_through_the_slot() {
        let buffer = Arc::new(OplogBuffer::new(1 << 20));
        buffer.push(raw_insert(1, "app.events"));
        buffer.push(raw_insert(2, "app.events"));
        let shutdown = ShutdownSignal::new();
        let batcher = Batcher::spawn(BatcherContext {
            buffer: Arc::clone(&buffer),
            coordinator: Arc::new(LocalCoordinator::recovering()),
            config: ApplyConfig::default(),
            shutdown: shutdown.clone(),
        });

        let mut got = 0;
        for _ in 0..50 {
            let ops = batcher.next_batch(Duration::from_millis(200));
            got += ops.len();
            if got >= 2 {
                break;
            }
        }
        assert_eq!(got, 2);

        shutdown.set();
        loop {
            let ops = batcher.next_batch(Duration::from_secs(1));
            if ops.must_shutdown() {
                break;
            }
        }
        batcher.join();
    }
}
