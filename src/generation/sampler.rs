//! Token sampling strategies for text generation.

use std::cmp::Ordering;
use std::collections::HashSet;

use rand::prelude::*;

use crate::{LlmError, TokenId};

/// Decoding knobs consumed by the [`Sampler`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    /// Number of highest logits kept (must be at least 1)
    pub top_k: i32,
    /// Nucleus probability mass kept (must be above 0)
    pub top_p: f32,
    /// Logit divisor; 0 or below means greedy argmax
    pub temperature: f32,
    /// Penalty for recently seen tokens; exactly 1.0 disables it
    pub repetition_penalty: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            top_k: 40,
            top_p: 0.95,
            temperature: 0.8,
            repetition_penalty: 1.0,
        }
    }
}

impl SamplingParams {
    /// Reject parameter combinations that would leave no candidate.
    pub fn validate(&self) -> crate::Result<()> {
        if self.top_k < 1 {
            return Err(LlmError::InvalidParameter(format!(
                "top_k must be at least 1, got {}",
                self.top_k
            )));
        }
        if self.top_p.is_nan() || self.top_p <= 0.0 {
            return Err(LlmError::InvalidParameter(format!(
                "top_p must be above 0, got {}",
                self.top_p
            )));
        }
        if self.repetition_penalty.is_nan() || self.repetition_penalty <= 0.0 {
            return Err(LlmError::InvalidParameter(format!(
                "repetition_penalty must be above 0, got {}",
                self.repetition_penalty
            )));
        }
        if self.temperature.is_nan() {
            return Err(LlmError::InvalidParameter("temperature is NaN".to_string()));
        }
        Ok(())
    }

    /// Whether sampling collapses to argmax
    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }

    /// Whether the recent-token set can affect the result
    pub fn uses_repetition_penalty(&self) -> bool {
        self.repetition_penalty != 1.0
    }
}

/// Token sampler applying repetition penalty, temperature, top-k and top-p.
///
/// The sampler holds no random state: the caller passes the generator, so
/// the same seed, logits and parameters always give the same token.
#[derive(Debug, Clone)]
pub struct Sampler {
    params: SamplingParams,
}

impl Sampler {
    /// Create a sampler after validating its parameters
    pub fn new(params: SamplingParams) -> crate::Result<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    /// Sample a token from logits
    ///
    /// # Arguments
    /// * `logits` - One score per vocabulary entry
    /// * `recent` - Tokens subject to the repetition penalty
    /// * `rng` - Generator for the final categorical draw (unused when greedy)
    pub fn sample<R: Rng + ?Sized>(
        &self,
        logits: &[f32],
        recent: &HashSet<TokenId>,
        rng: &mut R,
    ) -> crate::Result<TokenId> {
        let candidates = self.distribution(logits, recent)?;

        if self.params.is_greedy() {
            return Ok(candidates[0].0);
        }

        Ok(Self::draw(&candidates, rng))
    }

    /// Final candidate distribution as `(token, probability)` pairs,
    /// ordered by descending probability.
    ///
    /// Greedy parameters yield the single argmax token with probability 1.
    pub fn distribution(
        &self,
        logits: &[f32],
        recent: &HashSet<TokenId>,
    ) -> crate::Result<Vec<(TokenId, f32)>> {
        if logits.is_empty() {
            return Err(LlmError::InvalidParameter("empty logits".to_string()));
        }

        let mut scores = logits.to_vec();
        if self.params.uses_repetition_penalty() {
            self.apply_repetition_penalty(&mut scores, recent);
        }

        if self.params.is_greedy() {
            return Ok(vec![(Self::argmax(&scores), 1.0)]);
        }

        let temperature = self.params.temperature;
        let mut candidates: Vec<(TokenId, f32)> = scores
            .iter()
            .enumerate()
            .map(|(id, &score)| (id as TokenId, score / temperature))
            .collect();

        Self::top_k_filter(&mut candidates, self.params.top_k as usize);
        Self::softmax(&mut candidates);
        Self::top_p_filter(&mut candidates, self.params.top_p);

        if candidates.is_empty() {
            return Err(LlmError::InvalidParameter(
                "no candidate tokens left after truncation".to_string(),
            ));
        }

        Ok(candidates)
    }

    /// Apply repetition penalty to logits
    ///
    /// Positive scores are divided by the penalty and the rest multiplied,
    /// so a penalty above 1 always pushes a recent token down.
    pub fn apply_repetition_penalty(&self, scores: &mut [f32], recent: &HashSet<TokenId>) {
        let penalty = self.params.repetition_penalty;
        for &token in recent {
            if let Some(score) = scores.get_mut(token as usize) {
                if *score > 0.0 {
                    *score /= penalty;
                } else {
                    *score *= penalty;
                }
            }
        }
    }

    /// Greedy argmax selection, lowest index on ties
    fn argmax(scores: &[f32]) -> TokenId {
        let mut best = 0;
        for (idx, &score) in scores.iter().enumerate().skip(1) {
            if score > scores[best] {
                best = idx;
            }
        }
        best as TokenId
    }

    /// Descending by score, then ascending by id
    fn rank(a: &(TokenId, f32), b: &(TokenId, f32)) -> Ordering {
        b.1.total_cmp(&a.1).then(a.0.cmp(&b.0))
    }

    /// Keep the `k` best candidates, sorted by [`Self::rank`]
    fn top_k_filter(candidates: &mut Vec<(TokenId, f32)>, k: usize) {
        if k < candidates.len() {
            candidates.select_nth_unstable_by(k - 1, Self::rank);
            candidates.truncate(k);
        }
        candidates.sort_unstable_by(Self::rank);
    }

    /// Numerically stable softmax over sorted candidates
    fn softmax(candidates: &mut [(TokenId, f32)]) {
        let Some(&(_, max)) = candidates.first() else {
            return;
        };

        let mut sum = 0.0f32;
        for (_, score) in candidates.iter_mut() {
            *score = (*score - max).exp();
            sum += *score;
        }
        for (_, score) in candidates.iter_mut() {
            *score /= sum;
        }
    }

    /// Keep the smallest prefix whose mass reaches `p`, then renormalize
    fn top_p_filter(candidates: &mut Vec<(TokenId, f32)>, p: f32) {
        if p >= 1.0 {
            return;
        }

        let mut cumsum = 0.0f32;
        let mut keep = candidates.len();
        for (i, (_, prob)) in candidates.iter().enumerate() {
            cumsum += prob;
            if cumsum >= p {
                keep = i + 1;
                break;
            }
        }
        candidates.truncate(keep);

        let total: f32 = candidates.iter().map(|(_, prob)| prob).sum();
        for (_, prob) in candidates.iter_mut() {
            *prob /= total;
        }
    }

    /// Sample from probability distribution
    fn draw<R: Rng + ?Sized>(candidates: &[(TokenId, f32)], rng: &mut R) -> TokenId {
        let total: f64 = candidates.iter().map(|&(_, p)| p as f64).sum();
        let sample: f64 = rng.random::<f64>() * total;

        let mut cumsum = 0.0f64;
        for &(token, prob) in candidates {
            cumsum += prob as f64;
            if sample < cumsum {
                return token;
            }
        }

        // Rounding can leave the sample just past the last bucket
        candidates[candidates.len() - 1].0
    }
}
