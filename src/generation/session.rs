//! Generation session: context tracking, batched evaluation and sampling.

use std::collections::HashSet;
use std::path::Path;

use rand::prelude::*;

use super::{RecencyBuffer, Sampler, SamplingParams};
use crate::config::ModelType;
use crate::model::{ModelBackend, Vocabulary};
use crate::utils::{resolve_threads, SeedSource, TimeSeed};
use crate::{LlmError, TokenId};

/// One model plus the state needed to generate from it.
///
/// A session serves a single caller at a time; every mutating method takes
/// `&mut self`. Use one session per worker to generate concurrently.
pub struct GenerationSession {
    backend: Box<dyn ModelBackend>,
    model_type: ModelType,
    seed_source: Box<dyn SeedSource>,
    initialized: bool,
    n_ctx: usize,
    eos_token: TokenId,
    vocab: Vocabulary,
    /// Logits of the most recent evaluation, empty before the first one
    logits: Vec<f32>,
    /// Tokens consumed by the backend, newest last
    previous_tokens: RecencyBuffer,
}

impl GenerationSession {
    /// Create an uninitialized session around a backend
    pub fn new(backend: Box<dyn ModelBackend>, model_type: ModelType) -> Self {
        Self {
            backend,
            model_type,
            seed_source: Box::new(TimeSeed),
            initialized: false,
            n_ctx: 0,
            eos_token: 0,
            vocab: Vocabulary::default(),
            logits: Vec::new(),
            previous_tokens: RecencyBuffer::new(1),
        }
    }

    /// Replace the source consulted when `sample` gets a negative seed
    pub fn with_seed_source(mut self, seed_source: Box<dyn SeedSource>) -> Self {
        self.seed_source = seed_source;
        self
    }

    /// Load the model. Succeeds at most once per session.
    ///
    /// A failed load leaves the session uninitialized.
    pub fn init(&mut self, source: impl AsRef<Path>) -> crate::Result<()> {
        if self.initialized {
            return Err(LlmError::AlreadyInitialized);
        }

        let source = source.as_ref();
        let loaded = self.backend.load(source).map_err(|e| match e {
            LlmError::LoadFailure(msg) => LlmError::LoadFailure(msg),
            other => LlmError::LoadFailure(other.to_string()),
        })?;

        if loaded.params.n_ctx == 0 {
            return Err(LlmError::LoadFailure(format!(
                "{} model reports a zero context length",
                self.backend.name()
            )));
        }
        if loaded.vocab.is_empty() {
            return Err(LlmError::LoadFailure(format!(
                "{} model loaded an empty vocabulary",
                self.backend.name()
            )));
        }

        self.n_ctx = loaded.params.n_ctx;
        self.eos_token = loaded
            .params
            .eos_token_id
            .unwrap_or_else(|| loaded.vocab.eos_token());
        self.vocab = loaded.vocab;
        self.logits.clear();
        self.previous_tokens.init(self.n_ctx);
        self.initialized = true;

        tracing::info!(
            "Initialized {} session from {:?} (n_ctx {}, vocab {}, eos {})",
            self.model_type,
            source,
            self.n_ctx,
            self.vocab.len(),
            self.eos_token
        );
        Ok(())
    }

    /// Convert text to token ids
    pub fn tokenize(&self, text: &str) -> crate::Result<Vec<TokenId>> {
        self.vocab.tokenize(text)
    }

    /// Text of a token, or `""` for ids outside the vocabulary
    pub fn detokenize(&self, token: TokenId) -> &str {
        self.vocab.token_text(token).unwrap_or("")
    }

    /// Concatenated text of several tokens
    pub fn detokenize_all(&self, tokens: &[TokenId]) -> String {
        tokens.iter().map(|&t| self.detokenize(t)).collect()
    }

    /// Evaluate tokens in consecutive chunks of at most `batch_size`.
    ///
    /// Stops at the first failing chunk. Chunks evaluated before it stay
    /// committed to the backend cache and the recency buffer.
    pub fn batch_eval(&mut self, tokens: &[TokenId], batch_size: usize, threads: i32) -> crate::Result<()> {
        if !self.initialized {
            return Err(LlmError::NotInitialized);
        }
        if batch_size == 0 {
            return Err(LlmError::InvalidParameter("batch_size must be at least 1".to_string()));
        }

        let threads = resolve_threads(threads);
        for batch in tokens.chunks(batch_size) {
            self.eval_batch(batch, threads)?;
        }
        Ok(())
    }

    /// Number of cached tokens the backend may keep for a batch of `batch_len`.
    ///
    /// Clamped so that retained history plus the new batch fits the context.
    pub fn n_past_for(&self, batch_len: usize) -> usize {
        self.n_ctx
            .saturating_sub(batch_len)
            .min(self.previous_tokens.len())
    }

    fn eval_batch(&mut self, batch: &[TokenId], threads: usize) -> crate::Result<()> {
        let n_past = self.n_past_for(batch.len());
        tracing::debug!(
            "Evaluating batch of {} tokens (n_past {}, threads {})",
            batch.len(),
            n_past,
            threads
        );

        let logits = self
            .backend
            .evaluate(batch, threads, n_past)
            .map_err(|e| match e {
                LlmError::EvaluationFailure(msg) => LlmError::EvaluationFailure(msg),
                other => LlmError::EvaluationFailure(other.to_string()),
            })?;

        self.logits = logits;
        for &token in batch {
            self.previous_tokens.add(token);
        }
        Ok(())
    }

    /// Pick the next token from the last evaluation's logits.
    ///
    /// Before any evaluation this returns the end-of-sequence id without
    /// drawing a seed. `last_n_tokens < 0` covers the whole context and
    /// `seed < 0` asks the session's seed source, which by default is the
    /// wall clock and therefore not reproducible.
    pub fn sample(
        &mut self,
        top_k: i32,
        top_p: f32,
        temperature: f32,
        repetition_penalty: f32,
        last_n_tokens: i32,
        seed: i64,
    ) -> crate::Result<TokenId> {
        let params = SamplingParams {
            top_k,
            top_p,
            temperature,
            repetition_penalty,
        };
        self.sample_with(&params, last_n_tokens, seed)
    }

    /// [`sample`](Self::sample) with the sampler knobs grouped
    pub fn sample_with(&mut self, params: &SamplingParams, last_n_tokens: i32, seed: i64) -> crate::Result<TokenId> {
        if self.logits.is_empty() {
            return Ok(self.eos_token);
        }
        let sampler = Sampler::new(*params)?;

        let last_n_tokens = if last_n_tokens < 0 {
            self.n_ctx as i64
        } else {
            last_n_tokens as i64
        };
        let seed = if seed < 0 {
            self.seed_source.next_seed()
        } else {
            seed as u64
        };
        let mut rng = StdRng::seed_from_u64(seed);

        let recent = self.penalized_tokens(params, last_n_tokens);

        let vocab_size = self.vocab.len();
        let live = &self.logits[self.logits.len().saturating_sub(vocab_size)..];
        let token = sampler.sample(live, &recent, &mut rng)?;

        tracing::trace!("Sampled token {} (seed {})", token, seed);
        Ok(token)
    }

    /// Tokens the repetition penalty applies to; empty when it is disabled
    fn penalized_tokens(&self, params: &SamplingParams, last_n_tokens: i64) -> HashSet<TokenId> {
        if params.uses_repetition_penalty() {
            self.previous_tokens.recent(last_n_tokens)
        } else {
            HashSet::new()
        }
    }

    /// Whether `token` ends generation.
    ///
    /// True for the canonical end-of-sequence id. Architectures with an
    /// extra marker in [`ModelType::eos_marker`] also stop on a token whose
    /// text equals that marker, provided the vocabulary has special tokens.
    pub fn is_eos_token(&self, token: TokenId) -> bool {
        if token == self.eos_token {
            return true;
        }
        match self.model_type.eos_marker() {
            Some(marker) if self.vocab.has_special_tokens() => self.detokenize(token) == marker,
            _ => false,
        }
    }

    /// Forget the last logits and the recent tokens.
    ///
    /// The backend keeps its own cache; the next evaluation passes
    /// `n_past = 0`, which discards it.
    pub fn reset(&mut self) {
        self.logits.clear();
        self.previous_tokens.clear();
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Context length in tokens (0 before `init`)
    pub fn context_length(&self) -> usize {
        self.n_ctx
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    pub fn eos_token(&self) -> TokenId {
        self.eos_token
    }

    pub fn model_type(&self) -> ModelType {
        self.model_type
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }

    /// Logits of the last evaluation
    pub fn logits(&self) -> &[f32] {
        &self.logits
    }

    /// Number of tokens in the recency buffer
    pub fn recent_len(&self) -> usize {
        self.previous_tokens.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::model::{LoadedModel, ModelParameters};
    use crate::utils::FixedSeed;

    /// Calls observed by [`MockBackend`]
    #[derive(Debug, Default)]
    pub(crate) struct Calls {
        pub loads: usize,
        pub evals: Vec<(Vec<TokenId>, usize, usize)>,
    }

    /// Backend returning fixed logits and recording every call
    pub(crate) struct MockBackend {
        pub calls: Arc<Mutex<Calls>>,
        pub tokens: Vec<String>,
        pub special: Vec<String>,
        pub n_ctx: usize,
        pub logits: Vec<f32>,
        pub fail_load: bool,
        /// Fail the evaluation with this index (0-based)
        pub fail_eval_at: Option<usize>,
    }

    impl MockBackend {
        pub(crate) fn new(n_ctx: usize) -> Self {
            Self {
                calls: Arc::new(Mutex::new(Calls::default())),
                tokens: ["<|endoftext|>", "a", "b", "c", "### End"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
                special: Vec::new(),
                n_ctx,
                logits: vec![0.0, 1.0, 2.0, 0.5, -1.0],
                fail_load: false,
                fail_eval_at: None,
            }
        }
    }

    impl ModelBackend for MockBackend {
        fn name(&self) -> &str {
            "mock"
        }

        fn load(&mut self, _source: &Path) -> crate::Result<LoadedModel> {
            self.calls.lock().unwrap().loads += 1;
            if self.fail_load {
                return Err(LlmError::LoadFailure("broken weights".to_string()));
            }
            Ok(LoadedModel {
                params: ModelParameters {
                    n_ctx: self.n_ctx,
                    eos_token_id: None,
                },
                vocab: Vocabulary::new(self.tokens.clone(), &self.special),
            })
        }

        fn evaluate(&mut self, tokens: &[TokenId], threads: usize, n_past: usize) -> crate::Result<Vec<f32>> {
            let mut calls = self.calls.lock().unwrap();
            let index = calls.evals.len();
            calls.evals.push((tokens.to_vec(), threads, n_past));
            if self.fail_eval_at == Some(index) {
                return Err(LlmError::EvaluationFailure("out of memory".to_string()));
            }
            Ok(self.logits.clone())
        }
    }

    /// Counts how often a seed is requested
    struct CountingSeed(Arc<Mutex<usize>>);

    impl SeedSource for CountingSeed {
        fn next_seed(&mut self) -> u64 {
            *self.0.lock().unwrap() += 1;
            99
        }
    }

    fn session(backend: MockBackend) -> (GenerationSession, Arc<Mutex<Calls>>) {
        let calls = backend.calls.clone();
        let mut session = GenerationSession::new(Box::new(backend), ModelType::Gpt2)
            .with_seed_source(Box::new(FixedSeed(7)));
        session.init("mock.bin").unwrap();
        (session, calls)
    }

    #[test]
    fn test_init_only_once() {
        let (mut session, calls) = session(MockBackend::new(16));
        assert!(session.is_initialized());
        assert_eq!(session.context_length(), 16);

        assert!(matches!(session.init("again.bin"), Err(LlmError::AlreadyInitialized)));
        assert_eq!(calls.lock().unwrap().loads, 1);
        assert_eq!(session.context_length(), 16);
    }

    #[test]
    fn test_failed_init_stays_uninitialized() {
        let mut backend = MockBackend::new(16);
        backend.fail_load = true;
        let mut session = GenerationSession::new(Box::new(backend), ModelType::Gpt2);

        assert!(matches!(session.init("x.bin"), Err(LlmError::LoadFailure(_))));
        assert!(!session.is_initialized());
        assert!(matches!(session.batch_eval(&[1], 4, 1), Err(LlmError::NotInitialized)));
    }

    #[test]
    fn test_zero_context_is_load_failure() {
        let mut session = GenerationSession::new(Box::new(MockBackend::new(0)), ModelType::Gpt2);
        assert!(matches!(session.init("x.bin"), Err(LlmError::LoadFailure(_))));
        assert!(!session.is_initialized());
    }

    #[test]
    fn test_empty_vocabulary_is_load_failure() {
        let mut backend = MockBackend::new(16);
        backend.tokens.clear();
        let mut session = GenerationSession::new(Box::new(backend), ModelType::Gpt2);

        assert!(matches!(session.init("x.bin"), Err(LlmError::LoadFailure(_))));
        assert!(!session.is_initialized());
    }

    #[test]
    fn test_no_recent_set_without_penalty() {
        let (mut session, _calls) = session(MockBackend::new(4));
        session.batch_eval(&[1, 2, 3, 4, 1, 2], 2, 1).unwrap();
        assert_eq!(session.recent_len(), 4);

        let params = SamplingParams {
            repetition_penalty: 1.0,
            ..SamplingParams::default()
        };
        assert!(session.penalized_tokens(&params, 4).is_empty());
        assert!(session.penalized_tokens(&params, -1).is_empty());

        let params = SamplingParams {
            repetition_penalty: 1.3,
            ..SamplingParams::default()
        };
        assert_eq!(session.penalized_tokens(&params, 4), HashSet::from([1, 2, 3, 4]));
        assert_eq!(session.penalized_tokens(&params, 2), HashSet::from([1, 2]));
    }

    #[test]
    fn test_batch_eval_chunks_in_order() {
        let (mut session, calls) = session(MockBackend::new(64));
        let tokens: Vec<TokenId> = (0..10).map(|i| i % 4).collect();

        session.batch_eval(&tokens, 4, 2).unwrap();

        let calls = calls.lock().unwrap();
        let lengths: Vec<usize> = calls.evals.iter().map(|(b, _, _)| b.len()).collect();
        assert_eq!(lengths, vec![4, 4, 2]);
        let replayed: Vec<TokenId> = calls.evals.iter().flat_map(|(b, _, _)| b.clone()).collect();
        assert_eq!(replayed, tokens);
        let n_past: Vec<usize> = calls.evals.iter().map(|&(_, _, n)| n).collect();
        assert_eq!(n_past, vec![0, 4, 8]);
        assert!(calls.evals.iter().all(|&(_, t, _)| t == 2));

        assert_eq!(session.recent_len(), 10);
        assert_eq!(session.logits().len(), 5);
    }

    #[test]
    fn test_n_past_sliding_window() {
        let (mut session, _) = session(MockBackend::new(8));
        session.batch_eval(&[1, 2, 3, 1, 2], 8, 1).unwrap();
        assert_eq!(session.recent_len(), 5);
        assert_eq!(session.n_past_for(3), 5);
        assert_eq!(session.n_past_for(4), 4);
        assert_eq!(session.n_past_for(20), 0);
    }

    #[test]
    fn test_recency_bounded_by_context() {
        let (mut session, calls) = session(MockBackend::new(8));
        session.batch_eval(&[1; 18], 3, 1).unwrap();
        assert_eq!(session.recent_len(), 8);
        // Once full, each batch of 3 keeps 5 cached tokens
        assert_eq!(calls.lock().unwrap().evals.last().unwrap().2, 5);
    }

    #[test]
    fn test_batch_eval_stops_at_failure() {
        let mut backend = MockBackend::new(64);
        backend.fail_eval_at = Some(1);
        let (mut session, calls) = session(backend);

        let err = session.batch_eval(&[1, 2, 3, 1, 2, 3, 1], 3, 1).unwrap_err();
        assert!(matches!(err, LlmError::EvaluationFailure(_)));
        assert_eq!(calls.lock().unwrap().evals.len(), 2);
        // First chunk stays committed
        assert_eq!(session.recent_len(), 3);
    }

    #[test]
    fn test_batch_eval_rejects_zero_batch() {
        let (mut session, _) = session(MockBackend::new(8));
        assert!(matches!(
            session.batch_eval(&[1], 0, 1),
            Err(LlmError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_default_threads_resolved() {
        let (mut session, calls) = session(MockBackend::new(8));
        session.batch_eval(&[1], 1, -1).unwrap();
        let threads = calls.lock().unwrap().evals[0].1;
        assert!((1..=4).contains(&threads));
    }

    #[test]
    fn test_sample_without_logits_returns_eos() {
        let backend = MockBackend::new(8);
        let requested = Arc::new(Mutex::new(0));
        let mut session = GenerationSession::new(Box::new(backend), ModelType::Gpt2)
            .with_seed_source(Box::new(CountingSeed(requested.clone())));
        session.init("mock.bin").unwrap();

        let token = session.sample(40, 0.95, 0.8, 1.0, -1, -1).unwrap();
        assert_eq!(token, session.eos_token());
        assert_eq!(*requested.lock().unwrap(), 0);

        session.batch_eval(&[1], 1, 1).unwrap();
        session.sample(40, 0.95, 0.8, 1.0, -1, -1).unwrap();
        assert_eq!(*requested.lock().unwrap(), 1);
    }

    #[test]
    fn test_sample_deterministic_with_seed() {
        let (mut session, _) = session(MockBackend::new(8));
        session.batch_eval(&[1, 2], 2, 1).unwrap();

        let first = session.sample(40, 0.95, 1.0, 1.3, 4, 42).unwrap();
        for _ in 0..5 {
            assert_eq!(session.sample(40, 0.95, 1.0, 1.3, 4, 42).unwrap(), first);
        }
    }

    #[test]
    fn test_sample_greedy_and_penalty() {
        let (mut session, _) = session(MockBackend::new(8));
        session.batch_eval(&[3], 1, 1).unwrap();

        // Logits [0, 1, 2, 0.5, -1]: token 2 wins
        assert_eq!(session.sample(40, 0.95, 0.0, 1.0, -1, 1).unwrap(), 2);

        // Recent token 2 drops to 2 / 4 = 0.5, token 1 wins
        session.batch_eval(&[2], 1, 1).unwrap();
        assert_eq!(session.sample(40, 0.95, 0.0, 4.0, -1, 1).unwrap(), 1);

        // A window of one token only sees 2
        session.batch_eval(&[1, 2], 2, 1).unwrap();
        assert_eq!(session.sample(40, 0.95, 0.0, 4.0, 1, 1).unwrap(), 1);
        // An empty window penalizes nothing
        assert_eq!(session.sample(40, 0.95, 0.0, 4.0, 0, 1).unwrap(), 2);
    }

    #[test]
    fn test_sample_uses_vocab_tail_of_logits() {
        let mut backend = MockBackend::new(8);
        // Two leading junk entries before the five live ones
        backend.logits = vec![100.0, 100.0, 0.0, 1.0, 2.0, 0.5, -1.0];
        let (mut session, _) = session(backend);
        session.batch_eval(&[1], 1, 1).unwrap();

        assert_eq!(session.sample(40, 0.95, 0.0, 1.0, -1, 1).unwrap(), 2);
    }

    #[test]
    fn test_sample_rejects_invalid_top_k() {
        let (mut session, _) = session(MockBackend::new(8));
        session.batch_eval(&[1], 1, 1).unwrap();
        assert!(matches!(
            session.sample(0, 0.95, 0.8, 1.0, -1, 1),
            Err(LlmError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_eos_without_special_tokens() {
        let (session, _) = session(MockBackend::new(8));
        assert_eq!(session.eos_token(), 0);
        assert!(session.is_eos_token(0));
        assert!(!session.is_eos_token(4));
        assert!(!session.is_eos_token(1));
    }

    #[test]
    fn test_eos_marker_needs_special_tokens() {
        let mut backend = MockBackend::new(8);
        backend.special = vec!["### End".to_string()];
        let mut dolly = GenerationSession::new(Box::new(backend), ModelType::DollyV2);
        dolly.init("dolly.bin").unwrap();
        assert!(dolly.is_eos_token(4));
        assert!(dolly.is_eos_token(0));
        assert!(!dolly.is_eos_token(1));

        let mut plain = GenerationSession::new(Box::new(MockBackend::new(8)), ModelType::DollyV2);
        plain.init("dolly.bin").unwrap();
        assert!(!plain.is_eos_token(4));

        // Other architectures never use the marker
        let mut backend = MockBackend::new(8);
        backend.special = vec!["### End".to_string()];
        let mut neox = GenerationSession::new(Box::new(backend), ModelType::GptNeoX);
        neox.init("neox.bin").unwrap();
        assert!(!neox.is_eos_token(4));
    }

    #[test]
    fn test_detokenize_unknown_is_empty() {
        let (session, _) = session(MockBackend::new(8));
        assert_eq!(session.detokenize(1), "a");
        assert_eq!(session.detokenize(999), "");
        assert_eq!(session.detokenize_all(&[1, 999, 2]), "ab");
        assert_eq!(session.tokenize("abc").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_reset_clears_logits_and_recency() {
        let (mut session, calls) = session(MockBackend::new(8));
        session.batch_eval(&[1, 2, 3], 3, 1).unwrap();
        session.reset();

        assert!(session.logits().is_empty());
        assert_eq!(session.recent_len(), 0);
        assert_eq!(session.sample(40, 0.95, 0.8, 1.0, -1, 1).unwrap(), session.eos_token());

        session.batch_eval(&[1], 1, 1).unwrap();
        assert_eq!(calls.lock().unwrap().evals.last().unwrap().2, 0);
    }
}
