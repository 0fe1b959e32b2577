//! In-flight work visibility: the slot table.
//!
//! A fixed-capacity table of N = T+2 slots, one per file currently inside
//! the processing pipeline. Acquiring a slot blocks when the table is full,
//! which is the engine's backpressure mechanism: no work is queued beyond
//! what the table can show. Free slots are reused last-released-first.
//!
//! Slot contents are only ever written by the slot's current owner, so a
//! display layer may scan the table at any time holding nothing broader
//! than one slot's lock.
//!
//! Progress is rendered on **stderr** so stdout remains parseable for
//! scripts.

use anyhow::{bail, Result};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Stage of one file's journey through the pipeline. Transitions are
/// strictly forward, one step at a time; a fast file still reports every
/// step, just in quick succession.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum SlotStatus {
    Starting,
    Chunking,
    Vectorizing,
    Waiting,
    Finalizing,
    Complete,
}

impl SlotStatus {
    fn rank(self) -> u8 {
        match self {
            SlotStatus::Starting => 0,
            SlotStatus::Chunking => 1,
            SlotStatus::Vectorizing => 2,
            SlotStatus::Waiting => 3,
            SlotStatus::Finalizing => 4,
            SlotStatus::Complete => 5,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SlotStatus::Starting => "starting",
            SlotStatus::Chunking => "chunking",
            SlotStatus::Vectorizing => "vectorizing",
            SlotStatus::Waiting => "waiting",
            SlotStatus::Finalizing => "finalizing",
            SlotStatus::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone)]
struct SlotEntry {
    name: String,
    size: u64,
    status: SlotStatus,
    started: Instant,
}

/// Read-only view of one occupied slot, for display.
#[derive(Debug, Clone)]
pub struct SlotView {
    pub name: String,
    pub size: u64,
    pub status: SlotStatus,
    pub elapsed: Duration,
}

/// Fixed-capacity, thread-safe table of in-flight files.
pub struct SlotTable {
    permits: Arc<Semaphore>,
    free: Mutex<Vec<usize>>,
    slots: Vec<Mutex<Option<SlotEntry>>>,
}

impl SlotTable {
    pub fn new(capacity: usize) -> Self {
        // LIFO free stack: the most recently released slot is reused first.
        let free: Vec<usize> = (0..capacity).rev().collect();
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            free: Mutex::new(free),
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim a slot for `name`, suspending until one is free. Returns the
    /// slot id used for `update`/`release`.
    pub async fn acquire(&self, name: &str, size: u64) -> usize {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("slot semaphore closed");
        permit.forget();

        let id = self
            .free
            .lock()
            .unwrap()
            .pop()
            .expect("free stack empty despite available permit");

        *self.slots[id].lock().unwrap() = Some(SlotEntry {
            name: name.to_string(),
            size,
            status: SlotStatus::Starting,
            started: Instant::now(),
        });
        id
    }

    /// Advance a slot to the next status. Only the immediate successor is
    /// accepted; skipping or moving backwards is a caller bug.
    pub fn update(&self, id: usize, status: SlotStatus) -> Result<()> {
        let mut slot = self.slots[id].lock().unwrap();
        let entry = match slot.as_mut() {
            Some(entry) => entry,
            None => bail!("update on empty slot {id}"),
        };
        if status.rank() != entry.status.rank() + 1 {
            bail!(
                "invalid slot transition {} -> {} for {}",
                entry.status.label(),
                status.label(),
                entry.name
            );
        }
        entry.status = status;
        Ok(())
    }

    /// Return a slot to the free stack, regardless of its final status
    /// (failed files release without reaching COMPLETE).
    pub fn release(&self, id: usize) {
        *self.slots[id].lock().unwrap() = None;
        self.free.lock().unwrap().push(id);
        self.permits.add_permits(1);
    }

    /// Point-in-time scan of occupied slots, per-slot locking only.
    pub fn snapshot(&self) -> Vec<Option<SlotView>> {
        self.slots
            .iter()
            .map(|slot| {
                slot.lock().unwrap().as_ref().map(|entry| SlotView {
                    name: entry.name.clone(),
                    size: entry.size,
                    status: entry.status,
                    elapsed: entry.started.elapsed(),
                })
            })
            .collect()
    }
}

/// Progress rendering mode for the CLI: off, human (stderr), or JSON
/// (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }
}

/// Write one line per occupied slot to stderr.
pub fn render(table: &SlotTable, mode: ProgressMode) {
    if mode == ProgressMode::Off {
        return;
    }

    let mut stderr = std::io::stderr().lock();
    for (id, view) in table.snapshot().into_iter().enumerate() {
        let Some(view) = view else { continue };
        let line = match mode {
            ProgressMode::Human => format!(
                "index [{}] {}  {}  {:.1}s\n",
                id,
                view.name,
                view.status.label(),
                view.elapsed.as_secs_f64()
            ),
            ProgressMode::Json => {
                let obj = serde_json::json!({
                    "event": "progress",
                    "slot": id,
                    "file": view.name,
                    "size": view.size,
                    "status": view.status.label(),
                    "elapsed_ms": view.elapsed.as_millis() as u64,
                });
                format!("{obj}\n")
            }
            ProgressMode::Off => unreachable!(),
        };
        let _ = stderr.write_all(line.as_bytes());
    }
    let _ = stderr.flush();
}
