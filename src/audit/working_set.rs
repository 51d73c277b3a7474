use super::record::RequestRecord;
use std::collections::{HashMap, VecDeque};

/// Bounded FIFO of the most recently created records with an id lookup.
///
/// Positions are tracked as absolute sequence numbers so evicting from the
/// front never requires renumbering the rest of the index.
#[derive(Debug)]
pub struct WorkingSet {
    records: VecDeque<RequestRecord>,
    index: HashMap<String, u64>,
    /// Sequence number of `records[0]`
    first_seq: u64,
    capacity: usize,
}

impl WorkingSet {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity.min(4096)),
            index: HashMap::new(),
            first_seq: 0,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    fn position(&self, id: &str) -> Option<usize> {
        let seq = *self.index.get(id)?;
        usize::try_from(seq - self.first_seq).ok()
    }

    pub fn get(&self, id: &str) -> Option<&RequestRecord> {
        let pos = self.position(id)?;
        self.records.get(pos)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut RequestRecord> {
        let pos = self.position(id)?;
        self.records.get_mut(pos)
    }

    /// Append a new record, evicting the oldest when full. Returns the evicted
    /// record, if any.
    pub fn push(&mut self, record: RequestRecord) -> Option<RequestRecord> {
        let evicted = if self.records.len() >= self.capacity {
            self.evict_front()
        } else {
            None
        };

        let seq = self.first_seq + self.records.len() as u64;
        self.index.insert(record.id.clone(), seq);
        self.records.push_back(record);
        evicted
    }

    /// Replace the record created under the same id and timestamp in place,
    /// or append it otherwise. Later occurrences win while creation order is
    /// kept; an id reused by a later record starts a new entry.
    pub fn upsert(&mut self, record: RequestRecord) {
        match self.get_mut(&record.id) {
            Some(slot) if slot.timestamp == record.timestamp => *slot = record,
            _ => {
                self.push(record);
            }
        }
    }

    fn evict_front(&mut self) -> Option<RequestRecord> {
        let evicted = self.records.pop_front()?;
        if self.index.get(&evicted.id) == Some(&self.first_seq) {
            self.index.remove(&evicted.id);
        }
        self.first_seq += 1;
        Some(evicted)
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.index.clear();
        self.first_seq = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = &RequestRecord> {
        self.records.iter()
    }

    /// Independent copy in creation order.
    pub fn snapshot(&self) -> Vec<RequestRecord> {
        self.records.iter().cloned().collect()
    }
}
