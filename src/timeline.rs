//! Ordered timeline container.
//!
//! A timeline is a sequence of event ids in display order plus the two
//! pagination cursors that bound it. The events themselves live in the
//! room's [`EventGraph`](crate::graph::EventGraph); the sequence only holds
//! ids, so removal and local-echo re-keying never touch event ownership. An
//! id appears at most once. A cursor of `None` is terminal: there is no
//! more history (or future) in that direction.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Pagination direction, in timeline terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Towards older events.
    Backwards,
    /// Towards newer events.
    Forwards,
}

#[derive(Debug, Default)]
pub struct Timeline {
    order: Vec<String>,
    positions: HashMap<String, usize>,
    /// Token for fetching older events; `None` once history is exhausted.
    pub prev_batch: Option<String>,
    /// Token for fetching newer events; `None` on the live timeline, which
    /// is extended by sync instead.
    pub next_batch: Option<String>,
}

impl Timeline {
    pub fn new(prev_batch: Option<String>, next_batch: Option<String>) -> Self {
        Timeline {
            order: Vec::new(),
            positions: HashMap::new(),
            prev_batch,
            next_batch,
        }
    }

    pub fn token(&self, direction: Direction) -> Option<&str> {
        match direction {
            Direction::Backwards => self.prev_batch.as_deref(),
            Direction::Forwards => self.next_batch.as_deref(),
        }
    }

    pub fn set_token(&mut self, direction: Direction, token: Option<String>) {
        match direction {
            Direction::Backwards => self.prev_batch = token,
            Direction::Forwards => self.next_batch = token,
        }
    }

    /// Append to the newest end. Returns false on a duplicate id.
    pub fn append(&mut self, id: &str) -> bool {
        if self.positions.contains_key(id) {
            return false;
        }
        self.positions.insert(id.to_owned(), self.order.len());
        self.order.push(id.to_owned());
        true
    }

    /// Prepend to the oldest end. Returns false on a duplicate id.
    pub fn prepend(&mut self, id: &str) -> bool {
        if self.positions.contains_key(id) {
            return false;
        }
        self.order.insert(0, id.to_owned());
        self.reindex(0);
        true
    }

    /// Remove an id from the visible sequence, returning its old position.
    pub fn remove(&mut self, id: &str) -> Option<usize> {
        let position = self.positions.remove(id)?;
        self.order.remove(position);
        self.reindex(position);
        Some(position)
    }

    /// Swap an id in place, preserving its position. Used when a local echo
    /// is upgraded to its server-confirmed id.
    pub fn replace_id(&mut self, old: &str, new: &str) -> bool {
        let Some(position) = self.positions.remove(old) else {
            return false;
        };
        self.order[position] = new.to_owned();
        self.positions.insert(new.to_owned(), position);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.positions.get(id).copied()
    }

    pub fn ids(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn reindex(&mut self, from: usize) {
        for (position, id) in self.order.iter().enumerate().skip(from) {
            self.positions.insert(id.clone(), position);
        }
    }
}
