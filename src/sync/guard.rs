//! Staleness guard: per-query generation counters.
//!
//! Every read bumps the counter for its query and carries the new value as a
//! token. A result may only be committed while its token is still the latest
//! one handed out for that query; older results are dropped on arrival.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::EntityFamily;

/// Logical identity of a read: entity family plus owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
  pub family: EntityFamily,
  pub owner: Option<String>,
}

impl QueryKey {
  pub fn new(family: EntityFamily, owner: Option<&str>) -> Self {
    Self {
      family,
      owner: owner.map(String::from),
    }
  }
}

/// Generation handed out by [`StalenessGuard::begin_fetch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FetchToken(u64);

#[derive(Debug, Default)]
pub struct StalenessGuard {
  generations: Mutex<HashMap<QueryKey, u64>>,
}

impl StalenessGuard {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn begin_fetch(&self, key: &QueryKey) -> FetchToken {
    // Counters stay valid even if a holder panicked mid-update
    let mut generations = self.generations.lock().unwrap_or_else(|e| e.into_inner());
    let generation = generations.entry(key.clone()).or_insert(0);
    *generation += 1;
    FetchToken(*generation)
  }

  pub fn is_current(&self, key: &QueryKey, token: FetchToken) -> bool {
    let generations = self.generations.lock().unwrap_or_else(|e| e.into_inner());
    generations.get(key).copied() == Some(token.0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_latest_token_is_current() {
    let guard = StalenessGuard::new();
    let key = QueryKey::new(EntityFamily::Message, Some("c1"));

    let first = guard.begin_fetch(&key);
    assert!(guard.is_current(&key, first));

    let second = guard.begin_fetch(&key);
    assert!(second > first);
    assert!(!guard.is_current(&key, first));
    assert!(guard.is_current(&key, second));
  }

  #[test]
  fn test_keys_are_independent() {
    let guard = StalenessGuard::new();
    let c1 = QueryKey::new(EntityFamily::Message, Some("c1"));
    let c2 = QueryKey::new(EntityFamily::Message, Some("c2"));
    let all = QueryKey::new(EntityFamily::Conversation, None);

    let t1 = guard.begin_fetch(&c1);
    guard.begin_fetch(&c2);
    guard.begin_fetch(&all);

    assert!(guard.is_current(&c1, t1));
    // A token from one query never validates another
    assert!(!guard.is_current(&QueryKey::new(EntityFamily::Project, None), t1));
  }
}
