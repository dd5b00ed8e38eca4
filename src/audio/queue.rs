use rand::seq::SliceRandom;
use rand::Rng;
use std::{collections::VecDeque, time::Duration};
use tracing::debug;

use crate::sources::Track;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    #[default]
    Off,
    Track,
    Queue,
}

/// Tracks pendientes de un player más el que está sonando.
#[derive(Debug)]
pub struct TrackQueue {
    items: VecDeque<Track>,
    current: Option<Track>,
    history: Vec<Track>,
    loop_mode: LoopMode,
    max_history: usize,
}

impl Default for TrackQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackQueue {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
            current: None,
            history: Vec::new(),
            loop_mode: LoopMode::Off,
            max_history: 50,
        }
    }

    pub fn enqueue(&mut self, track: Track) {
        debug!(title = %track.title(), "➕ Agregado a la cola");
        self.items.push_back(track);
    }

    pub fn enqueue_many(&mut self, tracks: impl IntoIterator<Item = Track>) -> usize {
        let before = self.items.len();
        self.items.extend(tracks);
        let added = self.items.len() - before;
        debug!(added, "➕ Tracks agregados a la cola");
        added
    }

    /// Pone `track` como el actual y mueve el anterior al historial.
    pub fn start(&mut self, track: Track) {
        if let Some(previous) = self.current.replace(track) {
            self.add_to_history(previous);
        }
    }

    /// Advances to the next track, honoring the loop mode.
    ///
    /// `Track` returns the in-flight track again; `Queue` rotates the
    /// finished track to the back before popping.
    pub fn pop_next(&mut self) -> Option<Track> {
        self.advance(self.loop_mode == LoopMode::Track)
    }

    /// Like [`pop_next`](Self::pop_next) but never repeats the in-flight
    /// track, so a skip always moves forward.
    pub fn skip(&mut self) -> Option<Track> {
        self.advance(false)
    }

    fn advance(&mut self, repeat_current: bool) -> Option<Track> {
        if let Some(current) = self.current.take() {
            match self.loop_mode {
                LoopMode::Track if repeat_current => {
                    self.current = Some(current.clone());
                    return Some(current);
                }
                LoopMode::Queue => self.items.push_back(current.clone()),
                LoopMode::Track | LoopMode::Off => {}
            }
            self.add_to_history(current);
        }

        let next = self.items.pop_front();
        self.current = next.clone();
        next
    }

    /// Olvida el track actual sin avanzar.
    pub fn finish_current(&mut self) -> Option<Track> {
        let finished = self.current.take();
        if let Some(track) = &finished {
            self.add_to_history(track.clone());
        }
        finished
    }

    pub fn remove(&mut self, index: usize) -> Result<Track> {
        self.items.remove(index).ok_or_else(|| {
            Error::InvalidState(format!(
                "queue index {index} out of range (len {})",
                self.items.len()
            ))
        })
    }

    /// Fisher-Yates sobre los pendientes; el track actual no se toca.
    pub fn shuffle(&mut self) {
        self.shuffle_with(&mut rand::thread_rng());
    }

    pub fn shuffle_with<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.items.make_contiguous().shuffle(rng);
        debug!(len = self.items.len(), "🔀 Cola mezclada");
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn current(&self) -> Option<&Track> {
        self.current.as_ref()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.items.iter()
    }

    pub fn history(&self) -> &[Track] {
        &self.history
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Duración de los pendientes más el actual. Los streams cuentan como cero.
    pub fn total_duration(&self) -> Duration {
        self.items
            .iter()
            .chain(self.current.iter())
            .filter_map(Track::duration)
            .sum()
    }

    fn add_to_history(&mut self, track: Track) {
        self.history.push(track);
        if self.history.len() > self.max_history {
            self.history.remove(0);
        }
    }
}
