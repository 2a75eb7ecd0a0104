//! Per-key deduplication of concurrent upstream work.
//!
//! The first caller for a key becomes the owner and runs the fetch; every
//! concurrent caller for the same key blocks until the owner finishes. The
//! owner keeps its private result (a live artifact whose buffer or file
//! handle cannot be shared), while followers receive only a cloneable
//! summary `S` — typically "the artifact is on disk now" or the saved
//! origin's expiry — and are expected to re-read the persisted artifact
//! themselves. The filesystem, not memory, is the shared result channel.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

/// How a [`SingleFlight::run`] call participated in the flight.
pub enum Outcome<S, T> {
  /// This caller ran the closure; the result is its private value.
  Owner(Result<T>),
  /// This caller waited on the owner and sees the shared summary, or the
  /// owner's error.
  Follower(Result<S>),
}

struct Flight<S> {
  result: Mutex<Option<Result<S>>>,
  cv: Condvar,
}

impl<S: Clone> Flight<S> {
  fn new() -> Flight<S> {
    Flight {
      result: Mutex::new(None),
      cv: Condvar::new(),
    }
  }

  fn set(&self, result: Result<S>) {
    if let Ok(mut slot) = self.result.lock() {
      *slot = Some(result);
      self.cv.notify_all();
    }
  }

  fn wait(&self) -> Result<S> {
    let mut guard = self.result.lock().unwrap();
    while guard.is_none() {
      guard = self.cv.wait(guard).unwrap();
    }
    guard.as_ref().unwrap().clone()
  }
}

/// Keyed in-flight table. One instance lives on each upstream.
pub struct SingleFlight<S> {
  flights: Mutex<HashMap<String, Arc<Flight<S>>>>,
}

impl<S: Clone> SingleFlight<S> {
  pub fn new() -> SingleFlight<S> {
    SingleFlight {
      flights: Mutex::new(HashMap::new()),
    }
  }

  /// Runs `f` if this caller is first in for `key`; otherwise blocks until
  /// the owner finishes. The closure returns the shared summary alongside
  /// the owner's private value.
  pub fn run<T>(&self, key: &str, f: impl FnOnce() -> Result<(S, T)>) -> Outcome<S, T> {
    let (flight, is_owner) = self.join(key);
    if !is_owner {
      return Outcome::Follower(flight.wait());
    }

    let result = f();
    let (shared, private) = match result {
      Ok((shared, private)) => (Ok(shared), Ok(private)),
      Err(err) => (Err(err.clone()), Err(err)),
    };
    self.finish(key, &flight, shared);
    Outcome::Owner(private)
  }

  fn join(&self, key: &str) -> (Arc<Flight<S>>, bool) {
    let mut flights = self.flights.lock().unwrap();
    if let Some(existing) = flights.get(key) {
      return (Arc::clone(existing), false);
    }
    let flight = Arc::new(Flight::new());
    flights.insert(key.to_string(), Arc::clone(&flight));
    (flight, true)
  }

  fn finish(&self, key: &str, flight: &Arc<Flight<S>>, result: Result<S>) {
    flight.set(result);
    if let Ok(mut flights) = self.flights.lock() {
      flights.remove(key);
    }
  }
}

impl<S: Clone> Default for SingleFlight<S> {
  fn default() -> Self {
    SingleFlight::new()
  }
}
