//! Mutable, ordered expectation set with cheap concurrent snapshots.
//!
//! Readers take a snapshot (an `Arc` clone) and iterate it without holding
//! any lock; writers clone-and-swap the backing vector under a write lock.
//! Remaining-use counters live inside the shared `Expectation` values, so a
//! snapshot taken before a write still participates in use accounting.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

use mockgate_core::prelude::*;
use tracing::debug;

use crate::matching;
use crate::types::{Expectation, ExpectationDefinition, RequestFingerprint, RequestMatcher};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
	#[error("expectation capacity {0} exceeded")]
	CapacityExceeded(usize),
	#[error("invalid expectation: {0}")]
	Invalid(String),
}

pub struct ExpectationStore {
	inner: RwLock<Inner>,
	max_expectations: usize,
}

struct Inner {
	items: Arc<Vec<Arc<Expectation>>>,
	next_index: u64,
	generation: u64,
}

/// Consistent view used for one request's matching pass.
#[derive(Clone)]
pub struct Snapshot {
	items: Arc<Vec<Arc<Expectation>>>,
	pub generation: u64,
}

impl ExpectationStore {
	pub fn new(max_expectations: usize) -> ExpectationStore {
		ExpectationStore {
			inner: RwLock::new(Inner {
				items: Arc::new(Vec::new()),
				next_index: 0,
				generation: 0,
			}),
			max_expectations,
		}
	}

	/// Registers one expectation. A definition carrying the id of a live
	/// expectation replaces it in place, preserving its priority index;
	/// otherwise the expectation is appended.
	pub fn add(&self, def: ExpectationDefinition) -> Result<Strng, StoreError> {
		let mut inner = self.inner.write().expect("mutex acquired");
		let id: Strng = match &def.id {
			Some(id) => id.clone(),
			None => uuid::Uuid::new_v4().to_string().into(),
		};
		let mut items = inner.items.as_ref().clone();
		if let Some(pos) = items.iter().position(|e| e.id == id) {
			let index = items[pos].priority_index;
			items[pos] = Arc::new(Expectation::new(def, id.clone(), index));
		} else {
			if items.len() >= self.max_expectations {
				return Err(StoreError::CapacityExceeded(self.max_expectations));
			}
			let index = inner.next_index;
			inner.next_index += 1;
			items.push(Arc::new(Expectation::new(def, id.clone(), index)));
		}
		inner.items = Arc::new(items);
		Ok(id)
	}

	pub fn add_all(&self, defs: Vec<ExpectationDefinition>) -> Result<Vec<Strng>, StoreError> {
		defs.into_iter().map(|d| self.add(d)).collect()
	}

	/// Removes every expectation whose matcher equals the supplied one.
	pub fn remove(&self, matcher: &RequestMatcher) {
		let mut inner = self.inner.write().expect("mutex acquired");
		let items: Vec<_> = inner
			.items
			.iter()
			.filter(|e| !e.matcher.same_as(matcher))
			.cloned()
			.collect();
		inner.items = Arc::new(items);
	}

	pub fn snapshot(&self) -> Snapshot {
		let inner = self.inner.read().expect("mutex acquired");
		Snapshot {
			items: inner.items.clone(),
			generation: inner.generation,
		}
	}

	/// Drops a retired (exhausted or expired) expectation from the live set.
	/// A stale generation means a reset happened since the caller's snapshot;
	/// the removal is then a no-op so post-reset state stays untouched.
	pub fn retire(&self, id: &Strng, generation: u64) {
		let mut inner = self.inner.write().expect("mutex acquired");
		if inner.generation != generation {
			return;
		}
		if !inner.items.iter().any(|e| e.id == *id) {
			return;
		}
		debug!(id = id.as_str(), "retiring expectation");
		let items: Vec<_> = inner.items.iter().filter(|e| e.id != *id).cloned().collect();
		inner.items = Arc::new(items);
	}

	pub fn reset(&self) {
		let mut inner = self.inner.write().expect("mutex acquired");
		inner.items = Arc::new(Vec::new());
		inner.generation += 1;
	}

	pub fn len(&self) -> usize {
		self.inner.read().expect("mutex acquired").items.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn active_definitions(&self) -> Vec<ExpectationDefinition> {
		let now = Instant::now();
		self
			.inner
			.read()
			.expect("mutex acquired")
			.items
			.iter()
			.filter(|e| !e.is_expired(now) && !e.exhausted())
			.map(|e| e.definition())
			.collect()
	}
}

impl Snapshot {
	/// Picks the first live expectation matching `req` and consumes one use.
	/// Insertion order is the only tiebreak.
	pub fn select(
		&self,
		req: &RequestFingerprint,
	) -> Option<(Arc<Expectation>, HashMap<String, String>)> {
		let now = Instant::now();
		for e in self.items.iter() {
			if e.is_expired(now) {
				continue;
			}
			if let Some(params) = matching::matches(&e.matcher, req)
				&& e.try_consume()
			{
				return Some((e.clone(), params));
			}
		}
		None
	}

	pub fn iter(&self) -> impl Iterator<Item = &Arc<Expectation>> {
		self.items.iter()
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::types::{Action, ResponseDefinition, UseLimit};

	fn def(path: &str, times: UseLimit) -> ExpectationDefinition {
		ExpectationDefinition {
			id: None,
			request: serde_json::from_value(json!({"path": path})).unwrap(),
			action: Action::Respond(ResponseDefinition::default()),
			times,
			time_to_live: None,
		}
	}

	fn fingerprint(path: &str) -> RequestFingerprint {
		RequestFingerprint {
			method: "GET".to_string(),
			path: path.to_string(),
			..Default::default()
		}
	}

	#[test]
	fn insertion_order_is_the_tiebreak() {
		let store = ExpectationStore::new(100);
		let first = store.add(def("/x", UseLimit::Unlimited)).unwrap();
		store.add(def("/x", UseLimit::Unlimited)).unwrap();
		let (selected, _) = store.snapshot().select(&fingerprint("/x")).unwrap();
		assert_eq!(selected.id, first);
	}

	#[test]
	fn update_preserves_priority() {
		let store = ExpectationStore::new(100);
		let first = store.add(def("/a", UseLimit::Unlimited)).unwrap();
		store.add(def("/both", UseLimit::Unlimited)).unwrap();
		// Re-register the first id with a matcher that also hits /both.
		let mut updated = def("/both", UseLimit::Unlimited);
		updated.id = Some(first.clone());
		store.add(updated).unwrap();
		let (selected, _) = store.snapshot().select(&fingerprint("/both")).unwrap();
		assert_eq!(selected.id, first, "updated expectation keeps its slot");
	}

	#[test]
	fn capacity_is_enforced() {
		let store = ExpectationStore::new(2);
		store.add(def("/1", UseLimit::Unlimited)).unwrap();
		store.add(def("/2", UseLimit::Unlimited)).unwrap();
		assert!(matches!(
			store.add(def("/3", UseLimit::Unlimited)),
			Err(StoreError::CapacityExceeded(2))
		));
	}

	#[test]
	fn remove_by_matcher_equality() {
		let store = ExpectationStore::new(100);
		store.add(def("/gone", UseLimit::Unlimited)).unwrap();
		store.add(def("/stays", UseLimit::Unlimited)).unwrap();
		let matcher: RequestMatcher = serde_json::from_value(json!({"path": "/gone"})).unwrap();
		store.remove(&matcher);
		assert_eq!(store.len(), 1);
		assert!(store.snapshot().select(&fingerprint("/gone")).is_none());
	}

	#[test]
	fn bounded_uses_across_concurrent_selects() {
		let store = Arc::new(ExpectationStore::new(100));
		store.add(def("/once", UseLimit::Limited(3))).unwrap();
		let snapshot = store.snapshot();
		let hits: usize = std::thread::scope(|s| {
			(0..16)
				.map(|_| {
					let snap = snapshot.clone();
					s.spawn(move || snap.select(&fingerprint("/once")).is_some() as usize)
				})
				.collect::<Vec<_>>()
				.into_iter()
				.map(|h| h.join().unwrap())
				.sum()
		});
		assert_eq!(hits, 3);
	}

	#[test]
	fn retire_after_reset_is_a_noop() {
		let store = ExpectationStore::new(100);
		let id = store.add(def("/r", UseLimit::Limited(1))).unwrap();
		let snap = store.snapshot();
		store.reset();
		store.add(def("/post-reset", UseLimit::Unlimited)).unwrap();
		store.retire(&id, snap.generation);
		assert_eq!(store.len(), 1, "post-reset store is untouched");
	}

	#[test]
	fn old_snapshot_still_serves_after_reset() {
		let store = ExpectationStore::new(100);
		store.add(def("/old", UseLimit::Unlimited)).unwrap();
		let snap = store.snapshot();
		store.reset();
		assert!(snap.select(&fingerprint("/old")).is_some());
		assert!(store.snapshot().select(&fingerprint("/old")).is_none());
	}
}
