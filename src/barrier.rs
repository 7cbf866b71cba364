//! Deadline-bounded rendezvous over a group of independent units of work.
//!
//! Every work item runs in its own named thread. The caller blocks until all
//! units have reported back or the deadline passes. Units that miss the
//! deadline are reported as timed out and left to finish on their own; their
//! late results are discarded.

use crate::error::{Error, Result};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// Default rendezvous deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(900);

/// Default upper bound on units per run.
pub const DEFAULT_MAX_UNITS: usize = 99;

/// Outcome of one barrier run. Every submitted id is in exactly one map.
#[derive(Debug)]
pub struct BarrierReport<K, T> {
  pub results: BTreeMap<K, T>,
  pub errors: BTreeMap<K, Error>,
  /// Time from the first spawn until the rendezvous completed or timed out.
  pub elapsed: Duration,
}

impl<K, T> BarrierReport<K, T> {
  pub fn is_clean(&self) -> bool {
    self.errors.is_empty()
  }
}

/// Runs a shared callable once per work item and waits for all of them.
#[derive(Debug, Clone)]
pub struct Barrier {
  timeout: Duration,
  max_units: usize,
}

impl Default for Barrier {
  fn default() -> Self {
    Self {
      timeout: DEFAULT_TIMEOUT,
      max_units: DEFAULT_MAX_UNITS,
    }
  }
}

impl Barrier {
  pub fn new(timeout: Duration, max_units: usize) -> Self {
    Self { timeout, max_units }
  }

  pub fn timeout(&self) -> Duration {
    self.timeout
  }

  /// Invokes `callable` with each work item's arguments concurrently.
  ///
  /// # Behavior
  ///
  /// - A unit returning `Err` or panicking lands in `errors` and never affects siblings.
  /// - A unit still running at the deadline lands in `errors` as
  ///   `Error::BarrierTimeout`; it is not cancelled.
  /// - No ordering between units; the maps are keyed by work-item id.
  ///
  /// # Errors
  ///
  /// Returns `Error::Config` if more than `max_units` work items are submitted.
  /// Per-unit failures are never returned here, only reported.
  pub fn run<K, A, T, F>(&self, callable: F, work_items: BTreeMap<K, A>) -> Result<BarrierReport<K, T>>
  where
    K: Ord + Clone + Display + Send + 'static,
    A: Send + 'static,
    T: Send + 'static,
    F: Fn(A) -> Result<T> + Send + Sync + 'static,
  {
    if work_items.len() > self.max_units {
      return Err(Error::Config(format!(
        "barrier accepts at most {} units, got {}",
        self.max_units,
        work_items.len()
      )));
    }

    let start = Instant::now();
    // A timeout past the clock's range means no deadline at all
    let deadline = start.checked_add(self.timeout);
    let callable = Arc::new(callable);
    let (tx, rx) = mpsc::channel::<(K, thread::Result<Result<T>>)>();

    let mut results = BTreeMap::new();
    let mut errors = BTreeMap::new();
    let mut pending = BTreeSet::new();

    for (id, args) in work_items {
      let unit_tx = tx.clone();
      let unit_fn = Arc::clone(&callable);
      let unit_id = id.clone();

      let spawned = thread::Builder::new()
        .name(format!("bthread-{:0>2}", id))
        .spawn(move || {
          let outcome = panic::catch_unwind(AssertUnwindSafe(|| unit_fn(args)));
          // Receiver is gone once the caller stopped waiting.
          let _ = unit_tx.send((unit_id, outcome));
        });

      match spawned {
        Ok(_detached) => {
          pending.insert(id);
        }
        Err(e) => {
          tracing::error!(target: "shardscan::barrier", "Failed to spawn unit {}: {}", id, e);
          errors.insert(id, Error::Io(e));
        }
      }
    }
    drop(tx);

    while !pending.is_empty() {
      let received = match deadline {
        Some(deadline) => rx.recv_timeout(deadline.saturating_duration_since(Instant::now())).ok(),
        None => rx.recv().ok(),
      };
      match received {
        Some((id, outcome)) => {
          if !pending.remove(&id) {
            continue;
          }
          match outcome {
            Ok(Ok(value)) => {
              results.insert(id, value);
            }
            Ok(Err(e)) => {
              tracing::error!(target: "shardscan::barrier", "Error {} detected in unit {}", e, id);
              errors.insert(id, e);
            }
            Err(payload) => {
              let message = panic_message(payload.as_ref());
              tracing::error!(target: "shardscan::barrier", "Unit {} panicked: {}", id, message);
              errors.insert(
                id.clone(),
                Error::WorkerPanicked {
                  unit: id.to_string(),
                  message,
                },
              );
            }
          }
        }
        None => break,
      }
    }

    let elapsed = start.elapsed();
    for id in pending {
      tracing::error!(
        target: "shardscan::barrier",
        "Unit {} did not reach the barrier within {:?}",
        id,
        self.timeout
      );
      errors.insert(
        id.clone(),
        Error::BarrierTimeout {
          unit: id.to_string(),
          elapsed,
        },
      );
    }

    tracing::debug!(target: "shardscan::barrier", "Barrier passed after {:.2}s", elapsed.as_secs_f64());

    Ok(BarrierReport {
      results,
      errors,
      elapsed,
    })
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic payload".to_string()
  }
}
