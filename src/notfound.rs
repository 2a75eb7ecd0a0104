//! Bounded in-memory cache of known-missing paths.
//!
//! Sixteen buckets, each a reader-writer-locked map of path to expiry.
//! When a bucket outgrows its max it drops a fixed number of entries in
//! whatever order the map iterates; the goal is bounded memory, not
//! recency fidelity.

use crate::meta::unix_now;
use std::collections::HashMap;
use std::sync::RwLock;

const BUCKETS: usize = 16;

pub struct NotFoundCache {
  buckets: [Bucket; BUCKETS],
}

impl NotFoundCache {
  /// `max` bounds the total entry count across all buckets.
  pub fn new(max: usize) -> NotFoundCache {
    let bucket_max = max / BUCKETS;
    let prune = (bucket_max / 10).max(1);
    NotFoundCache {
      buckets: std::array::from_fn(|_| Bucket::new(bucket_max, prune)),
    }
  }

  pub fn get(&self, path: &str) -> bool {
    self.bucket(path).get(path)
  }

  pub fn set(&self, path: &str, ttl: u32) {
    self.bucket(path).set(path, ttl);
  }

  fn bucket(&self, path: &str) -> &Bucket {
    &self.buckets[(fnv32a(path.as_bytes()) & 15) as usize]
  }

  #[cfg(test)]
  fn bucket_sizes(&self) -> Vec<usize> {
    self
      .buckets
      .iter()
      .map(|b| b.items.read().unwrap().len())
      .collect()
  }
}

struct Bucket {
  max: usize,
  prune: usize,
  items: RwLock<HashMap<String, u32>>,
}

impl Bucket {
  fn new(max: usize, prune: usize) -> Bucket {
    Bucket {
      max,
      prune,
      items: RwLock::new(HashMap::new()),
    }
  }

  fn get(&self, path: &str) -> bool {
    let expires = match self.items.read().unwrap().get(path) {
      Some(&expires) => expires,
      None => return false,
    };

    if expires > unix_now() {
      return true;
    }

    // Expired, drop it before reporting a miss.
    self.items.write().unwrap().remove(path);
    false
  }

  fn set(&self, path: &str, ttl: u32) {
    let expires = unix_now() + ttl;
    let mut items = self.items.write().unwrap();
    items.insert(path.to_string(), expires);
    if items.len() < self.max {
      return;
    }

    let victims: Vec<String> = items.keys().take(self.prune).cloned().collect();
    for victim in victims {
      items.remove(&victim);
    }
  }
}

fn fnv32a(data: &[u8]) -> u32 {
  let mut hash: u32 = 0x811c_9dc5;
  for &b in data {
    hash ^= b as u32;
    hash = hash.wrapping_mul(0x0100_0193);
  }
  hash
}
