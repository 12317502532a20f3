//! Token and text generation loops on top of a session.

use super::{GenerationConfig, GenerationSession, SamplingParams};
use crate::TokenId;

impl GenerationSession {
    /// Evaluate a prompt and return an iterator over new tokens.
    ///
    /// Each step samples a token and feeds it back to the model. Iteration
    /// ends without yielding the end-of-sequence token. An error is yielded
    /// once and ends the iteration.
    pub fn generate(&mut self, tokens: &[TokenId], config: &GenerationConfig) -> crate::Result<Generate<'_>> {
        let params = config.sampling_params();
        params.validate()?;

        if config.reset {
            self.reset();
        }
        self.batch_eval(tokens, config.batch_size, config.threads)?;

        Ok(Generate {
            session: self,
            params,
            last_n_tokens: config.last_n_tokens,
            seed: config.seed,
            batch_size: config.batch_size,
            threads: config.threads,
            done: false,
        })
    }

    /// Generate text for a prompt, streamed in fragments.
    ///
    /// Fragments never contain a stop sequence; text that could still turn
    /// into one is held back until it is resolved.
    pub fn stream(&mut self, prompt: &str, config: &GenerationConfig) -> crate::Result<TextStream<'_>> {
        let prompt_tokens = self.tokenize(prompt)?;
        tracing::debug!("Prompt has {} tokens", prompt_tokens.len());

        let stop = config.stop.iter().filter(|s| !s.is_empty()).cloned().collect();
        let tokens = self.generate(&prompt_tokens, config)?;

        Ok(TextStream {
            tokens,
            stop,
            max_new_tokens: config.max_new_tokens,
            count: 0,
            text: String::new(),
            finished: false,
        })
    }

    /// Generate the complete text for a prompt
    pub fn complete(&mut self, prompt: &str, config: &GenerationConfig) -> crate::Result<String> {
        self.stream(prompt, config)?.collect()
    }
}

/// Iterator over generated tokens, see [`GenerationSession::generate`].
pub struct Generate<'a> {
    session: &'a mut GenerationSession,
    params: SamplingParams,
    last_n_tokens: i32,
    seed: i64,
    batch_size: usize,
    threads: i32,
    done: bool,
}

impl Generate<'_> {
    fn step(&mut self) -> crate::Result<Option<TokenId>> {
        let token = self
            .session
            .sample_with(&self.params, self.last_n_tokens, self.seed)?;
        self.session.batch_eval(&[token], self.batch_size, self.threads)?;

        if self.session.is_eos_token(token) {
            tracing::debug!("End of sequence token {}", token);
            return Ok(None);
        }
        Ok(Some(token))
    }
}

impl Iterator for Generate<'_> {
    type Item = crate::Result<TokenId>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(token)) => Some(Ok(token)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Iterator over generated text fragments, see [`GenerationSession::stream`].
pub struct TextStream<'a> {
    tokens: Generate<'a>,
    stop: Vec<String>,
    max_new_tokens: usize,
    count: usize,
    /// Generated text not yet handed out
    text: String,
    finished: bool,
}

impl TextStream<'_> {
    fn finish(&mut self) -> Option<crate::Result<String>> {
        self.finished = true;
        if self.text.is_empty() {
            None
        } else {
            Some(Ok(std::mem::take(&mut self.text)))
        }
    }
}

impl Iterator for TextStream<'_> {
    type Item = crate::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            if self.count >= self.max_new_tokens {
                return self.finish();
            }

            let token = match self.tokens.next() {
                None => return self.finish(),
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e));
                }
                Some(Ok(token)) => token,
            };
            self.text.push_str(self.tokens.session.detokenize(token));
            self.count += 1;

            if let Some(idx) = find_stop(&self.text, &self.stop) {
                self.text.truncate(idx);
                return self.finish();
            }

            let end = self.text.len() - partial_stop_len(&self.text, &self.stop);
            if end > 0 {
                let fragment: String = self.text.drain(..end).collect();
                return Some(Ok(fragment));
            }
        }
    }
}

/// Byte offset of the earliest stop sequence in `text`
fn find_stop(text: &str, stop: &[String]) -> Option<usize> {
    stop.iter().filter_map(|s| text.find(s.as_str())).min()
}

/// Length of the longest suffix of `text` that starts some stop sequence
fn partial_stop_len(text: &str, stop: &[String]) -> usize {
    stop.iter()
        .filter_map(|s| {
            (1..=s.len())
                .rev()
                .filter(|&i| s.is_char_boundary(i))
                .find(|&i| text.ends_with(&s[..i]))
        })
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::config::ModelType;
    use crate::model::bigram::tests::{sample_file, write_model};
    use crate::model::bigram::BigramFile;
    use crate::model::BigramModel;
    use crate::{FixedSeed, LlmError};

    /// Deterministic chain: `<|endoftext|>`, "he", "llo", " ", "wor", "ld", "!"
    ///
    /// Greedy decoding from "he" walks he → llo → " " → wor → ld → ! → end.
    fn chain_file() -> BigramFile {
        let tokens = ["<|endoftext|>", "he", "llo", " ", "wor", "ld", "!"];
        let next = [1usize, 2, 3, 4, 5, 6, 0];
        let logits = (0..tokens.len())
            .map(|row| {
                (0..tokens.len())
                    .map(|col| if col == next[row] { 5.0 } else { 0.0 })
                    .collect()
            })
            .collect();
        BigramFile {
            n_ctx: 32,
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            tokenizer: None,
            special_tokens: Vec::new(),
            eos_token: None,
            logits,
        }
    }

    fn session_for(dir: &Path, file: &BigramFile) -> GenerationSession {
        let path = write_model(dir, file);
        let mut session = GenerationSession::new(Box::new(BigramModel::new()), ModelType::Bigram)
            .with_seed_source(Box::new(FixedSeed(3)));
        session.init(&path).unwrap();
        session
    }

    #[test]
    fn test_generate_stops_at_eos() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_for(dir.path(), &chain_file());

        let tokens: Vec<TokenId> = session
            .generate(&[1], &GenerationConfig::greedy())
            .unwrap()
            .collect::<crate::Result<_>>()
            .unwrap();
        assert_eq!(tokens, vec![2, 3, 4, 5, 6]);
        // Prompt, five generated tokens and the end token were all evaluated
        assert_eq!(session.recent_len(), 7);
    }

    #[test]
    fn test_complete_greedy() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_for(dir.path(), &chain_file());

        let text = session.complete("he", &GenerationConfig::greedy()).unwrap();
        assert_eq!(text, "llo world!");
    }

    #[test]
    fn test_max_new_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_for(dir.path(), &chain_file());

        let config = GenerationConfig::greedy().with_max_tokens(2);
        assert_eq!(session.complete("he", &config).unwrap(), "llo ");

        let config = GenerationConfig::greedy().with_max_tokens(0);
        assert_eq!(session.complete("he", &config).unwrap(), "");
    }

    #[test]
    fn test_stop_sequence_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_for(dir.path(), &chain_file());

        let config = GenerationConfig::greedy().with_stop(["orl"]);
        let fragments: Vec<String> = session
            .stream("he", &config)
            .unwrap()
            .collect::<crate::Result<_>>()
            .unwrap();

        assert_eq!(fragments.concat(), "llo w");
        assert!(fragments.iter().all(|f| !f.contains("orl")));
    }

    #[test]
    fn test_partial_stop_held_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_for(dir.path(), &chain_file());

        // "wor" and "world" could start "world peace", so they wait until "!"
        let config = GenerationConfig::greedy().with_stop(["world peace"]);
        let fragments: Vec<String> = session
            .stream("he", &config)
            .unwrap()
            .collect::<crate::Result<_>>()
            .unwrap();

        assert_eq!(fragments, vec!["llo", " ", "world!"]);
    }

    #[test]
    fn test_reset_flag_controls_context() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_for(dir.path(), &chain_file());

        let config = GenerationConfig::greedy().with_max_tokens(1);
        session.complete("he", &config).unwrap();
        let after_first = session.recent_len();

        let mut keep = config.clone();
        keep.reset = false;
        session.complete("he", &keep).unwrap();
        assert!(session.recent_len() > after_first);

        session.complete("he", &config).unwrap();
        assert_eq!(session.recent_len(), after_first);
    }

    #[test]
    fn test_sampled_generation_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_for(dir.path(), &sample_file());

        let config = GenerationConfig::default().with_seed(11).with_max_tokens(6);
        let first = session.complete("a", &config).unwrap();
        let second = session.complete("a", &config).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_invalid_config_fails_before_eval() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_for(dir.path(), &chain_file());

        let mut config = GenerationConfig::greedy();
        config.top_k = 0;
        assert!(matches!(
            session.generate(&[1], &config),
            Err(LlmError::InvalidParameter(_))
        ));
        assert_eq!(session.recent_len(), 0);
    }

    #[test]
    fn test_partial_stop_len() {
        let stop = vec!["###".to_string(), "END".to_string()];
        assert_eq!(partial_stop_len("abc##", &stop), 2);
        assert_eq!(partial_stop_len("abcEN", &stop), 2);
        assert_eq!(partial_stop_len("abc", &stop), 0);
        assert_eq!(partial_stop_len("é", &["éx".to_string()]), "é".len());
        assert_eq!(find_stop("a END b ###", &stop), Some(2));
    }
}
