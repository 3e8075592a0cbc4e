use rand::Rng;
use std::collections::VecDeque;
use tracing::debug;

use crate::model::ConfiguredTrack;

/// Tracks waiting to be played, in insertion order.
#[derive(Debug, Default, Clone)]
pub(crate) struct TrackQueue {
    items: VecDeque<ConfiguredTrack>,
    shuffle: bool,
    repeat: bool,
}

impl TrackQueue {
    pub fn push(&mut self, track: ConfiguredTrack) {
        self.items.push_back(track);
    }

    /// Inserts at `index`, or at the tail when `index` is past the end.
    pub fn insert(&mut self, index: usize, track: ConfiguredTrack) {
        let index = index.min(self.items.len());
        self.items.insert(index, track);
    }

    pub fn remove(&mut self, index: usize) -> Option<ConfiguredTrack> {
        self.items.remove(index)
    }

    /// Removes the next track to play: a random one in shuffle mode, the head
    /// otherwise.
    pub fn take_next(&mut self) -> Option<ConfiguredTrack> {
        if self.shuffle && !self.items.is_empty() {
            let index = rand::thread_rng().gen_range(0..self.items.len());
            debug!("🔀 Picked queue entry {} at random", index);
            return self.items.remove(index);
        }

        self.items.pop_front()
    }

    /// Picks what follows `finished`. In repeat mode `finished` goes back to
    /// the tail, and is replayed right away when nothing else is queued.
    pub fn advance(&mut self, finished: Option<ConfiguredTrack>) -> Option<ConfiguredTrack> {
        let next = self.take_next();

        match (next, finished) {
            (Some(next), Some(finished)) if self.repeat => {
                self.items.push_back(finished);
                Some(next)
            }
            (None, Some(finished)) if self.repeat => Some(finished),
            (next, _) => next,
        }
    }

    pub fn clear(&mut self) -> usize {
        let removed = self.items.len();
        self.items.clear();
        removed
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn to_vec(&self) -> Vec<ConfiguredTrack> {
        self.items.iter().cloned().collect()
    }

    pub fn shuffle(&self) -> bool {
        self.shuffle
    }

    pub fn set_shuffle(&mut self, shuffle: bool) {
        self.shuffle = shuffle;
    }

    pub fn repeat(&self) -> bool {
        self.repeat
    }

    pub fn set_repeat(&mut self, repeat: bool) {
        self.repeat = repeat;
    }
}
