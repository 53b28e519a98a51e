//! # Routing Table
//!
//! 256 k-buckets indexed by the length of the prefix a contact's ID shares
//! with the local ID. Index 0 holds the farthest half of the ID space, index
//! 255 the closest contacts (and the local ID itself, which is never stored).
//!
//! Buckets keep their most-recently-seen contact at the front. A bucket that
//! is already full ignores newcomers: there is no liveness probe and no
//! eviction, so long-lived contacts are kept.
//!
//! The routing table is owned by the state actor (see `dht`) and is never
//! shared between tasks.

use std::collections::VecDeque;

use crate::identity::{distance_cmp, Contact, KademliaID, ID_LENGTH};

/// Default bucket capacity (Kademlia `k`).
pub const BUCKET_SIZE: usize = 20;

/// One bucket per bit of the ID space.
pub const BUCKET_COUNT: usize = ID_LENGTH * 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketTouchOutcome {
    Inserted,
    /// Contact was already known and moved to the front.
    Refreshed,
    /// Bucket at capacity; the newcomer was dropped.
    Full,
    /// The local node's own contact; never stored.
    Ignored,
}

#[derive(Debug, Clone)]
pub struct Bucket {
    contacts: VecDeque<Contact>,
    capacity: usize,
}

impl Default for Bucket {
    fn default() -> Self {
        Self::new(BUCKET_SIZE)
    }
}

impl Bucket {
    pub fn new(capacity: usize) -> Self {
        Self {
            contacts: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn add_contact(&mut self, contact: Contact) -> BucketTouchOutcome {
        if let Some(pos) = self.contacts.iter().position(|c| c.id == contact.id) {
            self.contacts.remove(pos);
            self.contacts.push_front(contact);
            return BucketTouchOutcome::Refreshed;
        }

        if self.contacts.len() < self.capacity {
            self.contacts.push_front(contact);
            BucketTouchOutcome::Inserted
        } else {
            BucketTouchOutcome::Full
        }
    }

    pub fn remove_contact(&mut self, id: &KademliaID) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| &c.id == id) {
            self.contacts.remove(pos);
            true
        } else {
            false
        }
    }

    /// Snapshot of every contact with `distance` set relative to `target`.
    /// The bucket's own ordering is untouched.
    pub fn get_contact_and_calc_distance(&self, target: &KademliaID) -> Vec<Contact> {
        self.contacts
            .iter()
            .map(|c| {
                let mut c = c.clone();
                c.calc_distance(target);
                c
            })
            .collect()
    }

    pub fn front(&self) -> Option<&Contact> {
        self.contacts.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}

/// Shared-prefix length of `a` and `b`, or `BUCKET_COUNT - 1` when equal.
pub fn bucket_index(a: &KademliaID, b: &KademliaID) -> usize {
    let dist = a.calc_distance(b);
    for (byte_idx, byte) in dist.as_bytes().iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    BUCKET_COUNT - 1
}

/// Sorts contacts by their cached `distance`, ascending. Stable.
pub fn sort_by_distance(contacts: &mut [Contact]) {
    contacts.sort_by(|a, b| distance_cmp(a.distance.as_bytes(), b.distance.as_bytes()));
}

#[derive(Debug)]
pub struct RoutingTable {
    me: Contact,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(me: Contact, bucket_size: usize) -> Self {
        let buckets = (0..BUCKET_COUNT).map(|_| Bucket::new(bucket_size)).collect();
        Self { me, buckets }
    }

    pub fn me(&self) -> &Contact {
        &self.me
    }

    pub fn add_contact(&mut self, contact: Contact) -> BucketTouchOutcome {
        if contact.id == self.me.id {
            return BucketTouchOutcome::Ignored;
        }
        let idx = self.get_bucket_index(&contact.id);
        self.buckets[idx].add_contact(contact)
    }

    pub fn remove_contact(&mut self, id: &KademliaID) -> bool {
        let idx = self.get_bucket_index(id);
        self.buckets[idx].remove_contact(id)
    }

    pub fn get_bucket_index(&self, id: &KademliaID) -> usize {
        bucket_index(&self.me.id, id)
    }

    pub fn bucket(&self, idx: usize) -> Option<&Bucket> {
        self.buckets.get(idx)
    }

    /// Up to `count` known contacts nearest to `target`, nearest first.
    ///
    /// Starts at the bucket `target` would fall into and widens one bucket
    /// at a time on both sides until enough candidates are gathered or both
    /// ends of the table are reached.
    pub fn find_closest_contacts(&self, target: &KademliaID, count: usize) -> Vec<Contact> {
        if count == 0 {
            return Vec::new();
        }

        let idx = self.get_bucket_index(target);
        let mut candidates = self.buckets[idx].get_contact_and_calc_distance(target);

        let mut step = 1;
        while candidates.len() < count && (step <= idx || idx + step < BUCKET_COUNT) {
            if step <= idx {
                candidates.extend(self.buckets[idx - step].get_contact_and_calc_distance(target));
            }
            if idx + step < BUCKET_COUNT {
                candidates.extend(self.buckets[idx + step].get_contact_and_calc_distance(target));
            }
            step += 1;
        }

        sort_by_distance(&mut candidates);
        candidates.truncate(count);
        candidates
    }

    /// Total number of stored contacts.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Bucket::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn id_with_first_byte(b: u8, tail: u8) -> KademliaID {
        let mut bytes = [0u8; ID_LENGTH];
        bytes[0] = b;
        bytes[ID_LENGTH - 1] = tail;
        KademliaID::from_bytes(bytes)
    }

    fn contact(id: KademliaID) -> Contact {
        Contact::new(id, format!("10.0.0.{}:4000", id.as_bytes()[ID_LENGTH - 1]))
    }

    #[test]
    fn bucket_moves_existing_contact_to_front() {
        let mut bucket = Bucket::new(3);
        let a = contact(id_with_first_byte(1, 1));
        let b = contact(id_with_first_byte(1, 2));
        assert_eq!(bucket.add_contact(a.clone()), BucketTouchOutcome::Inserted);
        assert_eq!(bucket.add_contact(b.clone()), BucketTouchOutcome::Inserted);
        assert_eq!(bucket.front(), Some(&b));

        assert_eq!(bucket.add_contact(a.clone()), BucketTouchOutcome::Refreshed);
        assert_eq!(bucket.front(), Some(&a));
        assert_eq!(bucket.len(), 2);
    }

    #[test]
    fn full_bucket_drops_newcomer() {
        let mut bucket = Bucket::new(2);
        bucket.add_contact(contact(id_with_first_byte(1, 1)));
        bucket.add_contact(contact(id_with_first_byte(1, 2)));
        let newcomer = contact(id_with_first_byte(1, 3));
        assert_eq!(bucket.add_contact(newcomer.clone()), BucketTouchOutcome::Full);
        assert_eq!(bucket.len(), 2);
        assert!(bucket.iter().all(|c| c != &newcomer));
    }

    #[test]
    fn bucket_snapshot_does_not_reorder() {
        let mut bucket = Bucket::new(5);
        for tail in 1..=4 {
            bucket.add_contact(contact(id_with_first_byte(1, tail)));
        }
        let before: Vec<_> = bucket.iter().map(|c| c.id).collect();
        let snapshot = bucket.get_contact_and_calc_distance(&KademliaID::random());
        let after: Vec<_> = bucket.iter().map(|c| c.id).collect();
        assert_eq!(before, after);
        assert_eq!(snapshot.len(), 4);
        assert!(snapshot.iter().all(|c| !c.distance.is_zero()));
    }

    #[test]
    fn bucket_index_tracks_shared_prefix() {
        let me = KademliaID::from_bytes([0u8; ID_LENGTH]);
        assert_eq!(bucket_index(&me, &id_with_first_byte(0x80, 0)), 0);
        assert_eq!(bucket_index(&me, &id_with_first_byte(0x40, 0)), 1);
        assert_eq!(bucket_index(&me, &id_with_first_byte(0x01, 0)), 7);
        assert_eq!(bucket_index(&me, &id_with_first_byte(0x00, 0x01)), 255);
        assert_eq!(bucket_index(&me, &me), 255);
    }

    #[test]
    fn closer_ids_never_map_to_lower_buckets() {
        let me = KademliaID::random();
        let mut ids: Vec<KademliaID> = (0..200).map(|_| KademliaID::random()).collect();
        ids.sort_by(|a, b| {
            distance_cmp(me.calc_distance(a).as_bytes(), me.calc_distance(b).as_bytes())
        });
        for pair in ids.windows(2) {
            assert!(bucket_index(&me, &pair[0]) >= bucket_index(&me, &pair[1]));
        }
    }

    #[test]
    fn self_contact_is_never_stored() {
        let me = contact(KademliaID::random());
        let mut table = RoutingTable::new(me.clone(), BUCKET_SIZE);
        assert_eq!(table.add_contact(me.clone()), BucketTouchOutcome::Ignored);
        assert!(table.is_empty());
    }

    #[test]
    fn find_closest_is_sorted_bounded_and_unique() {
        let me = contact(KademliaID::random());
        let mut table = RoutingTable::new(me, BUCKET_SIZE);
        for _ in 0..300 {
            let c = contact(KademliaID::random());
            table.add_contact(c.clone());
            table.add_contact(c);
        }

        let target = KademliaID::random();
        let found = table.find_closest_contacts(&target, 20);
        assert_eq!(found.len(), 20);

        let unique: HashSet<_> = found.iter().map(|c| c.id).collect();
        assert_eq!(unique.len(), found.len());

        for pair in found.windows(2) {
            assert_ne!(
                distance_cmp(pair[0].distance.as_bytes(), pair[1].distance.as_bytes()),
                std::cmp::Ordering::Greater
            );
        }
        for c in &found {
            assert_eq!(c.distance, c.id.calc_distance(&target));
        }
    }

    #[test]
    fn find_closest_clamps_to_available() {
        let me = contact(KademliaID::random());
        let mut table = RoutingTable::new(me, BUCKET_SIZE);
        for _ in 0..5 {
            table.add_contact(contact(KademliaID::random()));
        }
        assert_eq!(table.find_closest_contacts(&KademliaID::random(), 50).len(), 5);
        assert!(table.find_closest_contacts(&KademliaID::random(), 0).is_empty());
    }

    #[test]
    fn exact_match_comes_first() {
        let me = contact(KademliaID::random());
        let mut table = RoutingTable::new(me, BUCKET_SIZE);
        let wanted = contact(KademliaID::random());
        table.add_contact(wanted.clone());
        for _ in 0..50 {
            table.add_contact(contact(KademliaID::random()));
        }
        let found = table.find_closest_contacts(&wanted.id, 1);
        assert_eq!(found, vec![wanted]);
    }

    #[test]
    fn remove_contact_only_removes_target() {
        let me = contact(KademliaID::random());
        let mut table = RoutingTable::new(me, BUCKET_SIZE);
        let a = contact(KademliaID::random());
        let b = contact(KademliaID::random());
        table.add_contact(a.clone());
        table.add_contact(b.clone());
        assert!(table.remove_contact(&a.id));
        assert!(!table.remove_contact(&a.id));
        assert_eq!(table.len(), 1);
        assert_eq!(table.find_closest_contacts(&b.id, 5), vec![b]);
    }
}
