//! Subscription bookkeeping per connection generation

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::Subscription;

/// subject -> handle
type SubjectMap = DashMap<String, Box<dyn Subscription>>;

/// receiver id -> subjects
type Bucket = DashMap<String, SubjectMap>;

/// generation -> receiver id -> subject -> subscription handle
///
/// A (generation, receiver, subject) triple holds at most one handle. Handles
/// removed from the registry are returned to the caller, which unsubscribes them.
#[derive(Default)]
pub struct SubscriptionRegistry {
    generations: DashMap<u64, Arc<Bucket>>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking an empty bucket for `generation`
    pub fn open(&self, generation: u64) {
        self.generations.entry(generation).or_default();
    }

    #[must_use]
    pub fn is_open(&self, generation: u64) -> bool {
        self.generations.contains_key(&generation)
    }

    #[must_use]
    pub fn contains(&self, generation: u64, receiver_id: &str, subject: &str) -> bool {
        self.generations.get(&generation).is_some_and(|bucket| {
            bucket
                .get(receiver_id)
                .is_some_and(|subjects| subjects.contains_key(subject))
        })
    }

    /// Track `subscription` under (generation, receiver, subject)
    ///
    /// Hands the subscription back when the triple is already taken or the
    /// generation is no longer tracked.
    #[allow(clippy::let_and_return)]
    pub fn insert(
        &self,
        generation: u64,
        receiver_id: &str,
        subscription: Box<dyn Subscription>,
    ) -> Result<(), Box<dyn Subscription>> {
        // Holding the generation entry keeps `close` from racing the insert.
        let Some(bucket) = self.generations.get(&generation) else {
            return Err(subscription);
        };

        let subjects = bucket.entry(receiver_id.to_string()).or_default();
        // The entry guard has to drop before `subjects` and `bucket` do.
        let inserted = match subjects.entry(subscription.subject().to_string()) {
            Entry::Occupied(_) => Err(subscription),
            Entry::Vacant(slot) => {
                slot.insert(subscription);
                Ok(())
            }
        };
        inserted
    }

    /// Remove every handle owned by `receiver_id` in every generation
    pub fn remove_receiver(&self, receiver_id: &str) -> Vec<Box<dyn Subscription>> {
        let mut removed = Vec::new();
        for bucket in &self.generations {
            if let Some((_, subjects)) = bucket.remove(receiver_id) {
                removed.extend(subjects.into_iter().map(|(_, handle)| handle));
            }
        }
        removed
    }

    /// Stop tracking `generation` and return all of its handles
    pub fn close(&self, generation: u64) -> Vec<Box<dyn Subscription>> {
        self.generations
            .remove(&generation)
            .map(|(_, bucket)| take_all(&bucket))
            .unwrap_or_default()
    }

    /// Stop tracking every generation and return all handles
    pub fn close_all(&self) -> Vec<Box<dyn Subscription>> {
        let generations: Vec<u64> = self.generations.iter().map(|entry| *entry.key()).collect();
        generations.into_iter().flat_map(|generation| self.close(generation)).collect()
    }

    /// Handles held by `receiver_id` across all generations
    #[must_use]
    pub fn receiver_count(&self, receiver_id: &str) -> usize {
        self.generations
            .iter()
            .filter_map(|bucket| bucket.get(receiver_id).map(|subjects| subjects.len()))
            .sum()
    }

    /// Tracked generations, oldest first
    #[must_use]
    pub fn generations(&self) -> Vec<u64> {
        let mut generations: Vec<u64> = self.generations.iter().map(|entry| *entry.key()).collect();
        generations.sort_unstable();
        generations
    }
}

fn take_all(bucket: &Bucket) -> Vec<Box<dyn Subscription>> {
    let receivers: Vec<String> = bucket.iter().map(|entry| entry.key().clone()).collect();
    receivers
        .iter()
        .filter_map(|receiver| bucket.remove(receiver))
        .flat_map(|(_, subjects)| subjects.into_iter().map(|(_, handle)| handle))
        .collect()
}
