//! Session state and the single-token decode step.
//!
//! The runtime owns the per-layer KV caches and the session cursor
//! `seq_len`. Prefill and decode share one step routine: the step writes K
//! and V for the current position into the cache and attends over positions
//! `0..=pos`, which makes attention causal by construction — later
//! positions simply do not exist in the cache yet.

use crate::weights::{ModelConfig, NormKind, Weights};
use crate::ModelError;
use tracing::debug;

/// Per-layer attention cache indexed by `(head, position)`.
pub struct KvCache {
    n_heads: usize,
    max_seq: usize,
    head_dim: usize,
    k: Vec<f32>,
    v: Vec<f32>,
}

impl KvCache {
    /// Allocate a zeroed cache for `n_heads x max_seq x head_dim`.
    pub fn new(n_heads: usize, max_seq: usize, head_dim: usize) -> Self {
        let len = n_heads * max_seq * head_dim;
        Self { n_heads, max_seq, head_dim, k: vec![0.0; len], v: vec![0.0; len] }
    }

    fn index(&self, head: usize, pos: usize) -> usize {
        debug_assert!(head < self.n_heads && pos < self.max_seq);
        (head * self.max_seq + pos) * self.head_dim
    }

    /// Key slot for `(head, pos)`.
    pub fn k_row(&self, head: usize, pos: usize) -> &[f32] {
        let at = self.index(head, pos);
        &self.k[at..at + self.head_dim]
    }

    /// Value slot for `(head, pos)`.
    pub fn v_row(&self, head: usize, pos: usize) -> &[f32] {
        let at = self.index(head, pos);
        &self.v[at..at + self.head_dim]
    }

    fn k_row_mut(&mut self, head: usize, pos: usize) -> &mut [f32] {
        let at = self.index(head, pos);
        &mut self.k[at..at + self.head_dim]
    }

    fn v_row_mut(&mut self, head: usize, pos: usize) -> &mut [f32] {
        let at = self.index(head, pos);
        &mut self.v[at..at + self.head_dim]
    }

    fn reset(&mut self) {
        self.k.fill(0.0);
        self.v.fill(0.0);
    }
}

fn norm_row(kind: NormKind, x: &mut [f32], gain: &[f32], shift: &[f32]) {
    match kind {
        NormKind::RmsNorm => kernels::rms_norm_row(x, gain),
        NormKind::LayerNorm => kernels::layer_norm_row(x, gain, shift),
    }
}

/// A loaded model plus one decoding session (KV caches and cursor).
pub struct Runtime {
    weights: Weights,
    kv: Vec<KvCache>,
    seq_len: usize,
}

impl Runtime {
    /// Build a runtime over validated weights, allocating the KV caches.
    ///
    /// Tensor shapes are checked against the header here; a mismatch is a
    /// fatal [`ModelError::InvalidModel`].
    pub fn new(weights: Weights) -> Result<Self, ModelError> {
        check_shapes(&weights)?;
        let cfg = weights.cfg;
        let kv = (0..cfg.n_layers)
            .map(|_| KvCache::new(cfg.n_heads as usize, cfg.max_seq as usize, cfg.head_dim()))
            .collect();
        debug!(
            vocab = cfg.vocab,
            d_model = cfg.d_model,
            n_layers = cfg.n_layers,
            max_seq = cfg.max_seq,
            "runtime ready"
        );
        Ok(Self { weights, kv, seq_len: 0 })
    }

    /// Model header this runtime was built from.
    pub fn config(&self) -> &ModelConfig {
        &self.weights.cfg
    }

    /// Current session cursor (tokens consumed so far).
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Zero the KV caches and rewind the cursor.
    pub fn reset_session(&mut self) {
        for kv in &mut self.kv {
            kv.reset();
        }
        self.seq_len = 0;
    }

    /// Run the prompt through the model, returning the logits after its
    /// final token. Resets the session first.
    pub fn prefill(&mut self, tokens: &[u32]) -> Result<Vec<f32>, ModelError> {
        if tokens.is_empty() {
            return Err(ModelError::EmptyInput);
        }
        if tokens.len() > self.weights.cfg.max_seq as usize {
            return Err(ModelError::ContextExhausted);
        }
        self.reset_session();
        debug!(tokens = tokens.len(), "prefill");
        let mut logits = Vec::new();
        for &tok in tokens {
            logits = self.step(tok);
        }
        Ok(logits)
    }

    /// Advance the session by one token and return the next logits.
    pub fn decode_step(&mut self, token: u32) -> Result<Vec<f32>, ModelError> {
        if self.seq_len >= self.weights.cfg.max_seq as usize {
            return Err(ModelError::ContextExhausted);
        }
        Ok(self.step(token))
    }

    /// Mean-pooled token-embedding rows; out-of-range ids contribute zero.
    pub fn embed_mean_pool(&self, tokens: &[u32]) -> Result<Vec<f32>, ModelError> {
        if tokens.is_empty() {
            return Err(ModelError::EmptyInput);
        }
        let d = self.weights.cfg.d_model as usize;
        let vocab = self.weights.cfg.vocab as usize;
        let mut out = vec![0.0f32; d];
        for &tok in tokens {
            if (tok as usize) < vocab {
                let row = &self.weights.tok_emb[tok as usize * d..(tok as usize + 1) * d];
                for (o, &r) in out.iter_mut().zip(row) {
                    *o += r;
                }
            }
        }
        let inv = 1.0 / tokens.len() as f32;
        for o in &mut out {
            *o *= inv;
        }
        Ok(out)
    }

    // One token through every layer at position `self.seq_len`, then the
    // output head. Callers guarantee the position is inside the cache.
    fn step(&mut self, token: u32) -> Vec<f32> {
        let cfg = self.weights.cfg;
        let pos = self.seq_len;
        let d = cfg.d_model as usize;
        let vocab = cfg.vocab as usize;
        let heads = cfg.n_heads as usize;
        let hd = cfg.head_dim();
        let ff = cfg.d_ff as usize;

        let mut x = vec![0.0f32; d];
        if (token as usize) < vocab {
            x.copy_from_slice(&self.weights.tok_emb[token as usize * d..(token as usize + 1) * d]);
        }

        for l in 0..cfg.n_layers as usize {
            let ly = &self.weights.layers[l];
            let kv = &mut self.kv[l];

            norm_row(cfg.norm_kind, &mut x, &ly.ln1_g, &ly.ln1_b);

            let mut q = vec![0.0f32; d];
            let mut k = vec![0.0f32; d];
            let mut v = vec![0.0f32; d];
            kernels::affine(&x, &ly.wq, None, &mut q, 1, d, d);
            kernels::affine(&x, &ly.wk, None, &mut k, 1, d, d);
            kernels::affine(&x, &ly.wv, None, &mut v, 1, d, d);

            for h in 0..heads {
                let (qh, kh) = (&mut q[h * hd..(h + 1) * hd], &mut k[h * hd..(h + 1) * hd]);
                kernels::rope_rotate(qh, kh, pos, cfg.rope_theta_base, cfg.rope_freq_scale);
            }
            for h in 0..heads {
                kv.k_row_mut(h, pos).copy_from_slice(&k[h * hd..(h + 1) * hd]);
                kv.v_row_mut(h, pos).copy_from_slice(&v[h * hd..(h + 1) * hd]);
            }

            let mut attn = vec![0.0f32; d];
            let scale = 1.0 / (hd as f32).sqrt();
            for h in 0..heads {
                let qh = &q[h * hd..(h + 1) * hd];
                let mut scores: Vec<f32> = (0..=pos)
                    .map(|t| {
                        let dot: f32 = qh.iter().zip(kv.k_row(h, t)).map(|(a, b)| a * b).sum();
                        dot * scale
                    })
                    .collect();
                kernels::softmax_in_place(&mut scores);
                for (t, &s) in scores.iter().enumerate() {
                    for (d0, &vv) in kv.v_row(h, t).iter().enumerate() {
                        attn[h * hd + d0] += s * vv;
                    }
                }
            }

            let mut proj = vec![0.0f32; d];
            kernels::affine(&attn, &ly.wo, None, &mut proj, 1, d, d);
            for (xi, &p) in x.iter_mut().zip(&proj) {
                *xi += p;
            }

            norm_row(cfg.norm_kind, &mut x, &ly.ln2_g, &ly.ln2_b);

            // SwiGLU when W1 carries both projection blocks, plain ReLU
            // otherwise.
            let w1_cols = ly.w1.len() / d;
            let mut ff2 = vec![0.0f32; d];
            if w1_cols == 2 * ff {
                let (w1a, w1b) = ly.w1.split_at(d * ff);
                let mut a = vec![0.0f32; ff];
                let mut b = vec![0.0f32; ff];
                let mut gate = vec![0.0f32; ff];
                kernels::affine(&x, w1a, None, &mut a, 1, d, ff);
                kernels::affine(&x, w1b, None, &mut b, 1, d, ff);
                kernels::swiglu(&a, &b, &mut gate);
                kernels::affine(&gate, &ly.w2, None, &mut ff2, 1, ff, d);
            } else {
                let mut ff1 = vec![0.0f32; ff];
                kernels::affine(&x, &ly.w1, None, &mut ff1, 1, d, ff);
                for h in ff1.iter_mut() {
                    *h = h.max(0.0);
                }
                kernels::affine(&ff1, &ly.w2, None, &mut ff2, 1, ff, d);
            }
            for (xi, &f) in x.iter_mut().zip(&ff2) {
                *xi += f;
            }
        }

        norm_row(cfg.norm_kind, &mut x, &self.weights.ln_f_g, &self.weights.ln_f_b);
        let mut logits = vec![0.0f32; vocab];
        kernels::gemm(&x, &self.weights.lm_head, &mut logits, 1, d, vocab);

        self.seq_len += 1;
        logits
    }
}

fn check_shapes(w: &Weights) -> Result<(), ModelError> {
    let cfg = w.cfg;
    let d = cfg.d_model as usize;
    let v = cfg.vocab as usize;
    let ff = cfg.d_ff as usize;
    let w1_cols = cfg.w1_cols();

    let mut ok = w.tok_emb.len() == v * d
        && w.lm_head.len() == d * v
        && w.ln_f_g.len() == d
        && w.ln_f_b.len() == d
        && w.layers.len() == cfg.n_layers as usize;
    for ly in &w.layers {
        ok &= ly.wq.len() == d * d
            && ly.wk.len() == d * d
            && ly.wv.len() == d * d
            && ly.wo.len() == d * d
            && ly.w1.len() == d * w1_cols
            && ly.b1.len() == w1_cols
            && ly.w2.len() == ff * d
            && ly.b2.len() == d
            && ly.ln1_g.len() == d
            && ly.ln1_b.len() == d
            && ly.ln2_g.len() == d
            && ly.ln2_b.len() == d;
    }
    if ok {
        Ok(())
    } else {
        Err(ModelError::InvalidModel("tensor shape mismatch".into()))
    }
}
