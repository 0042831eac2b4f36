//! Token selection from logits.
//!
//! The filter pipeline runs in a fixed order: repetition penalty over a
//! sliding window of recent ids, then temperature, top-k, softmax, top-p
//! and min-prob. Sampling draws from the surviving distribution; with
//! sampling disabled (`do_sample == false` or `temperature <= 0`) the
//! argmax of the filtered probabilities wins.

use rand::rngs::StdRng;
use rand::Rng;
use std::time::Instant;

/// Only this many trailing ids of the context window are penalized, which
/// keeps the penalty pass cheap on long sessions.
pub const REPETITION_WINDOW: usize = 64;

/// Sampler configuration.
#[derive(Debug, Clone, Copy)]
pub struct Sampling {
    /// Softmax temperature; `<= 0` forces the argmax path.
    pub temperature: f32,
    /// Keep only the k largest logits; 0 disables.
    pub top_k: usize,
    /// Nucleus mass in `[0, 1]`; values outside `(0, 1)` disable.
    pub top_p: f32,
    /// Divide logits of recently emitted ids by this; `<= 1` disables.
    pub repetition_penalty: f32,
    /// Zero out probabilities below this after the other filters.
    pub min_prob: f32,
    /// Maximum number of tokens to generate.
    pub max_tokens: usize,
    /// When false, always take the argmax.
    pub do_sample: bool,
    /// Emit token events while generating.
    pub stream: bool,
}

impl Default for Sampling {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 40,
            top_p: 0.95,
            repetition_penalty: 1.1,
            min_prob: 0.0,
            max_tokens: 256,
            do_sample: true,
            stream: true,
        }
    }
}

/// Run the filter pipeline over a copy of `logits` and pick the next token.
pub fn sample_from_logits(
    logits: &[f32],
    recent_ids: &[u32],
    s: &Sampling,
    rng: &mut StdRng,
) -> u32 {
    let mut probs = logits.to_vec();

    let window_start = recent_ids.len().saturating_sub(REPETITION_WINDOW);
    kernels::apply_repetition_penalty(&mut probs, &recent_ids[window_start..], s.repetition_penalty);

    // Top-k runs on logits: order is invariant under the positive
    // temperature scaling folded into the softmax below.
    kernels::top_k_filter(&mut probs, s.top_k);
    kernels::softmax_with_temperature(&mut probs, s.temperature.max(0.0));
    kernels::top_p_filter(&mut probs, s.top_p);
    kernels::min_prob_filter(&mut probs, s.min_prob);

    if !s.do_sample || s.temperature <= 0.0 {
        return kernels::argmax(&probs) as u32;
    }

    let sum: f32 = probs.iter().sum();
    if sum <= 0.0 {
        return kernels::argmax(&probs) as u32;
    }
    let r: f32 = rng.gen_range(0.0..sum);
    let mut cum = 0.0;
    for (i, &p) in probs.iter().enumerate() {
        cum += p;
        if r <= cum {
            return i as u32;
        }
    }
    kernels::argmax(&probs) as u32
}

/// Tokens-per-second tracker for streamed token events.
pub struct TokenRate {
    start: Instant,
    tokens: usize,
}

impl TokenRate {
    /// Start a new measurement window.
    pub fn start() -> Self {
        Self { start: Instant::now(), tokens: 0 }
    }

    /// Record `n` emitted tokens.
    pub fn add(&mut self, n: usize) {
        self.tokens += n;
    }

    /// Tokens per second since the window started.
    pub fn tps(&self) -> f64 {
        let secs = self.start.elapsed().as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            self.tokens as f64 / secs
        }
    }
}
