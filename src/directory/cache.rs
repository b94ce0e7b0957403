//! Volume-location cache
//!
//! Volume assignments move rarely, so lookup answers are cached with a
//! TTL. Only successful answers are cached; a failed lookup must be
//! retried against the directory, never remembered.

use crate::directory::lookup::Location;
use crate::storage::VolumeId;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct CacheEntry {
    locations: Vec<Location>,
    jwt: String,
    deadline: Instant,
}

pub struct VidCache {
    ttl: Duration,
    entries: Mutex<HashMap<VolumeId, CacheEntry>>,
}

impl VidCache {
    pub fn new(ttl: Duration) -> VidCache {
        VidCache {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Fresh locations for a volume, or None past the deadline.
    pub fn get(&self, vid: VolumeId) -> Option<(Vec<Location>, String)> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(&vid) {
            Some(e) if e.deadline > Instant::now() => {
                Some((e.locations.clone(), e.jwt.clone()))
            }
            Some(_) => {
                entries.remove(&vid);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, vid: VolumeId, locations: Vec<Location>, jwt: String) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            vid,
            CacheEntry {
                locations,
                jwt,
                deadline: Instant::now() + self.ttl,
            },
        );
    }

    pub fn invalidate(&self, vid: VolumeId) {
        self.entries.lock().unwrap().remove(&vid);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
