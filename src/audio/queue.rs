use rand::{seq::SliceRandom, Rng};
use std::collections::VecDeque;
use tracing::{debug, info};

use super::track::Track;
use crate::error::{MusicError, MusicResult};

pub const DEFAULT_MAX_QUEUE_SIZE: usize = 32;

/// Bounded FIFO of tracks waiting to be played. The current track is not
/// stored here.
#[derive(Debug)]
pub struct TrackQueue {
    items: VecDeque<Track>,
    max_size: usize,
}

impl Default for TrackQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUEUE_SIZE)
    }
}

impl TrackQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(max_size.min(DEFAULT_MAX_QUEUE_SIZE)),
            max_size,
        }
    }

    /// Appends a track and returns its 1-indexed position.
    pub fn enqueue(&mut self, track: Track) -> MusicResult<usize> {
        if self.is_full() {
            return Err(MusicError::QueueFull {
                capacity: self.max_size,
            });
        }

        info!("➕ Added to queue: {}", track.title);
        self.items.push_back(track);
        Ok(self.items.len())
    }

    /// Pops the head of the queue (FIFO).
    pub fn dequeue(&mut self) -> Option<Track> {
        let next = self.items.pop_front();
        if let Some(ref track) = next {
            debug!("➡️ Next in queue: {}", track.title);
        }
        next
    }

    /// Empties the queue, returning how many tracks were dropped.
    pub fn clear(&mut self) -> usize {
        let cleared = self.len();
        self.items.clear();
        info!("🗑️ Queue cleared ({} tracks)", cleared);
        cleared
    }

    pub fn shuffle(&mut self) {
        self.shuffle_with(&mut rand::thread_rng());
    }

    /// Fisher-Yates over the queued tracks.
    pub fn shuffle_with<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.items.make_contiguous().shuffle(rng);
        if !self.is_empty() {
            info!("🔀 Queue shuffled ({} tracks)", self.len());
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_size
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.items.iter()
    }

    pub fn tracks(&self) -> Vec<Track> {
        self.iter().cloned().collect()
    }
}
