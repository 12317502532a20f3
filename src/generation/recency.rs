//! Fixed-capacity ring of recently consumed tokens.

use std::collections::HashSet;

use crate::TokenId;

/// Ring buffer holding the last `capacity` tokens fed to the model.
///
/// While filling, tokens are pushed and the cursor equals the length. Once
/// full, every [`add`](Self::add) overwrites the slot under the cursor,
/// which is always the oldest token.
#[derive(Debug, Clone)]
pub struct RecencyBuffer {
    /// Maximum number of retained tokens
    capacity: usize,
    /// Backing storage, never longer than `capacity`
    tokens: Vec<TokenId>,
    /// Next write position
    pos: usize,
}

impl RecencyBuffer {
    /// Create an empty buffer.
    ///
    /// # Panics
    /// If `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        let mut buffer = Self {
            capacity: 0,
            tokens: Vec::new(),
            pos: 0,
        };
        buffer.init(capacity);
        buffer
    }

    /// Set the capacity and drop all stored tokens.
    ///
    /// # Panics
    /// If `capacity` is zero.
    pub fn init(&mut self, capacity: usize) {
        assert!(capacity > 0, "recency buffer capacity must be positive");
        self.capacity = capacity;
        self.tokens = Vec::with_capacity(capacity);
        self.pos = 0;
    }

    /// Record a token, evicting the oldest one when full.
    pub fn add(&mut self, token: TokenId) {
        if self.tokens.len() < self.capacity {
            self.tokens.push(token);
        } else {
            self.tokens[self.pos] = token;
        }
        self.pos = (self.pos + 1) % self.capacity;
    }

    /// Distinct ids among the last `min(len, n)` added tokens.
    pub fn recent(&self, n: i64) -> HashSet<TokenId> {
        let size = self.tokens.len();
        if n <= 0 || size == 0 {
            return HashSet::new();
        }
        let n = (n as usize).min(size);

        // `pos` is in `[0, size)` once full and equals `size` while filling;
        // both cases reduce to the same modular start.
        let start = (self.pos + size - n) % size;
        if start < self.pos {
            self.tokens[start..self.pos].iter().copied().collect()
        } else {
            self.tokens[start..]
                .iter()
                .chain(&self.tokens[..self.pos])
                .copied()
                .collect()
        }
    }

    /// Drop all tokens, keeping the capacity.
    pub fn clear(&mut self) {
        self.tokens.clear();
        self.pos = 0;
    }

    /// Number of stored tokens
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Check if the buffer has started evicting
    pub fn is_full(&self) -> bool {
        self.tokens.len() == self.capacity
    }
}
