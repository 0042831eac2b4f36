//! Weight file format and the immutable tensor tables.
//!
//! A weight file is a fixed little-endian header optionally followed by a
//! raw `f32` payload. Header layout:
//!
//! ```text
//! magic    u32 = 0x464C4C43  ('CLLF')
//! version  u32 ∈ {1, 2}
//! endian   u32 = 1 (little)
//! reserved u32 = 0
//! vocab, d_model, n_heads, n_layers, d_ff, max_seq : u32
//! token_kind u32            // 0 = bytes, 1 = BPE
//! pad[5]   u32
//! // version >= 2 only:
//! mlp_kind        i32       // 0 = ReLU, 1 = SwiGLU
//! norm_kind       i32       // 0 = LayerNorm, 1 = RMSNorm
//! rope_theta_base f32
//! rope_freq_scale f32
//! ```
//!
//! Version 1 files default the architectural fields to
//! `norm_kind = RMSNorm, mlp_kind = ReLU, theta = 10000, scale = 1`.
//! Parsing a header and re-emitting it is byte identity.
//!
//! The payload, when present, carries every tensor as consecutive
//! little-endian `f32`s: `tok_emb`, then per layer `wq wk wv wo w1 b1 w2 b2
//! ln1_g ln1_b ln2_g ln2_b`, then `ln_f_g ln_f_b lm_head`. A file with no
//! payload loads as zero weights with unit norm gains. Any other payload
//! length is rejected.

use crate::ModelError;
use std::path::Path;

/// Weight file magic ('CLLF').
pub const WEIGHTS_MAGIC: u32 = 0x464C_4C43;

const HEADER_LEN_V1: usize = 64;
const HEADER_LEN_V2: usize = 80;

/// MLP variant, decided at load time by the header (or the W1 width).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MlpKind {
    /// `W1 -> ReLU -> W2`, W1 is `d_model x d_ff`.
    Relu,
    /// Gated MLP, W1 holds two `d_model x d_ff` projection blocks.
    SwiGlu,
}

/// Normalization variant applied before attention, before the MLP and at
/// the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormKind {
    /// Mean/variance LayerNorm with gain and shift.
    LayerNorm,
    /// RMSNorm with gain only.
    RmsNorm,
}

/// Tokenizer family the weights were trained with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Byte-level fallback vocabulary.
    Bytes,
    /// Byte-pair encoding vocabulary.
    Bpe,
}

/// Parsed weight file header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelConfig {
    /// Header version the file was written with (1 or 2).
    pub version: u32,
    /// Vocabulary size.
    pub vocab: u32,
    /// Embedding width.
    pub d_model: u32,
    /// Attention head count; must divide `d_model`.
    pub n_heads: u32,
    /// Decoder layer count.
    pub n_layers: u32,
    /// MLP hidden width.
    pub d_ff: u32,
    /// Maximum session length (KV cache capacity).
    pub max_seq: u32,
    /// Tokenizer family.
    pub token_kind: TokenKind,
    /// MLP variant.
    pub mlp_kind: MlpKind,
    /// Normalization variant.
    pub norm_kind: NormKind,
    /// RoPE base frequency.
    pub rope_theta_base: f32,
    /// RoPE frequency scale.
    pub rope_freq_scale: f32,
}

impl ModelConfig {
    /// Per-head dimension.
    pub fn head_dim(&self) -> usize {
        (self.d_model / self.n_heads) as usize
    }

    /// Column count of W1: `d_ff` for ReLU, `2 * d_ff` for SwiGLU. The
    /// runtime consults the resulting tensor width to pick the MLP path.
    pub fn w1_cols(&self) -> usize {
        match self.mlp_kind {
            MlpKind::Relu => self.d_ff as usize,
            MlpKind::SwiGlu => 2 * self.d_ff as usize,
        }
    }

    fn validate(&self) -> Result<(), ModelError> {
        if self.vocab == 0
            || self.d_model == 0
            || self.n_heads == 0
            || self.n_layers == 0
            || self.d_ff == 0
            || self.max_seq == 0
        {
            return Err(ModelError::InvalidModel("zero-sized dimension".into()));
        }
        if self.d_model % self.n_heads != 0 {
            return Err(ModelError::InvalidModel(format!(
                "d_model {} not divisible by n_heads {}",
                self.d_model, self.n_heads
            )));
        }
        Ok(())
    }

    fn f32_count(&self) -> usize {
        let v = self.vocab as usize;
        let d = self.d_model as usize;
        let ff = self.d_ff as usize;
        let per_layer = 4 * d * d          // wq wk wv wo
            + d * self.w1_cols()           // w1
            + self.w1_cols()               // b1
            + ff * d                       // w2
            + d                            // b2
            + 4 * d; // ln1_g ln1_b ln2_g ln2_b
        v * d + self.n_layers as usize * per_layer + 2 * d + d * v
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().expect("4 bytes"))
}

/// Decode a header from the front of `buf`, returning the config and the
/// number of bytes consumed.
pub fn decode_header(buf: &[u8]) -> Result<(ModelConfig, usize), ModelError> {
    if buf.len() < HEADER_LEN_V1 {
        return Err(ModelError::InvalidModel("truncated header".into()));
    }
    if read_u32(buf, 0) != WEIGHTS_MAGIC {
        return Err(ModelError::InvalidModel("bad magic".into()));
    }
    let version = read_u32(buf, 4);
    if version != 1 && version != 2 {
        return Err(ModelError::InvalidModel(format!("unsupported version {version}")));
    }
    if read_u32(buf, 8) != 1 {
        return Err(ModelError::InvalidModel("big-endian weight files are not supported".into()));
    }
    if read_u32(buf, 12) != 0 {
        return Err(ModelError::InvalidModel("nonzero reserved field".into()));
    }

    let token_kind = match read_u32(buf, 40) {
        0 => TokenKind::Bytes,
        1 => TokenKind::Bpe,
        other => {
            return Err(ModelError::InvalidModel(format!("unknown token_kind {other}")));
        }
    };

    let mut cfg = ModelConfig {
        version,
        vocab: read_u32(buf, 16),
        d_model: read_u32(buf, 20),
        n_heads: read_u32(buf, 24),
        n_layers: read_u32(buf, 28),
        d_ff: read_u32(buf, 32),
        max_seq: read_u32(buf, 36),
        token_kind,
        // version 1 defaults; overwritten below for version >= 2
        mlp_kind: MlpKind::Relu,
        norm_kind: NormKind::RmsNorm,
        rope_theta_base: 10_000.0,
        rope_freq_scale: 1.0,
    };

    let consumed = if version >= 2 {
        if buf.len() < HEADER_LEN_V2 {
            return Err(ModelError::InvalidModel("truncated v2 header".into()));
        }
        cfg.mlp_kind = match read_u32(buf, 64) as i32 {
            0 => MlpKind::Relu,
            1 => MlpKind::SwiGlu,
            other => {
                return Err(ModelError::InvalidModel(format!("unknown mlp_kind {other}")));
            }
        };
        cfg.norm_kind = match read_u32(buf, 68) as i32 {
            0 => NormKind::LayerNorm,
            1 => NormKind::RmsNorm,
            other => {
                return Err(ModelError::InvalidModel(format!("unknown norm_kind {other}")));
            }
        };
        cfg.rope_theta_base = f32::from_le_bytes(buf[72..76].try_into().expect("4 bytes"));
        cfg.rope_freq_scale = f32::from_le_bytes(buf[76..80].try_into().expect("4 bytes"));
        HEADER_LEN_V2
    } else {
        HEADER_LEN_V1
    };

    cfg.validate()?;
    Ok((cfg, consumed))
}

/// Re-emit a header in the exact wire layout for its version.
pub fn encode_header(cfg: &ModelConfig) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN_V2);
    buf.extend_from_slice(&WEIGHTS_MAGIC.to_le_bytes());
    buf.extend_from_slice(&cfg.version.to_le_bytes());
    buf.extend_from_slice(&1u32.to_le_bytes()); // endian
    buf.extend_from_slice(&0u32.to_le_bytes()); // reserved
    for v in [cfg.vocab, cfg.d_model, cfg.n_heads, cfg.n_layers, cfg.d_ff, cfg.max_seq] {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf.extend_from_slice(
        &match cfg.token_kind {
            TokenKind::Bytes => 0u32,
            TokenKind::Bpe => 1u32,
        }
        .to_le_bytes(),
    );
    for _ in 0..5 {
        buf.extend_from_slice(&0u32.to_le_bytes());
    }
    if cfg.version >= 2 {
        let mlp: i32 = match cfg.mlp_kind {
            MlpKind::Relu => 0,
            MlpKind::SwiGlu => 1,
        };
        let norm: i32 = match cfg.norm_kind {
            NormKind::LayerNorm => 0,
            NormKind::RmsNorm => 1,
        };
        buf.extend_from_slice(&mlp.to_le_bytes());
        buf.extend_from_slice(&norm.to_le_bytes());
        buf.extend_from_slice(&cfg.rope_theta_base.to_le_bytes());
        buf.extend_from_slice(&cfg.rope_freq_scale.to_le_bytes());
    }
    buf
}

/// Per-layer weight tensors, all row-major `f32`.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerWeights {
    /// Query projection, `d_model x d_model`.
    pub wq: Vec<f32>,
    /// Key projection, `d_model x d_model`.
    pub wk: Vec<f32>,
    /// Value projection, `d_model x d_model`.
    pub wv: Vec<f32>,
    /// Output projection, `d_model x d_model`.
    pub wo: Vec<f32>,
    /// First MLP projection; width depends on the MLP kind.
    pub w1: Vec<f32>,
    /// First MLP bias (carried by the format; the forward pass is bias-free).
    pub b1: Vec<f32>,
    /// Second MLP projection, `d_ff x d_model`.
    pub w2: Vec<f32>,
    /// Second MLP bias (carried by the format; the forward pass is bias-free).
    pub b2: Vec<f32>,
    /// Pre-attention norm gain.
    pub ln1_g: Vec<f32>,
    /// Pre-attention norm shift (LayerNorm only).
    pub ln1_b: Vec<f32>,
    /// Pre-MLP norm gain.
    pub ln2_g: Vec<f32>,
    /// Pre-MLP norm shift (LayerNorm only).
    pub ln2_b: Vec<f32>,
}

/// The full immutable weight table for a model.
#[derive(Debug, Clone, PartialEq)]
pub struct Weights {
    /// Parsed header.
    pub cfg: ModelConfig,
    /// Token embedding, `vocab x d_model`.
    pub tok_emb: Vec<f32>,
    /// Output head, `d_model x vocab`.
    pub lm_head: Vec<f32>,
    /// Final norm gain.
    pub ln_f_g: Vec<f32>,
    /// Final norm shift (LayerNorm only).
    pub ln_f_b: Vec<f32>,
    /// Per-layer tensors.
    pub layers: Vec<LayerWeights>,
}

impl Weights {
    /// Allocate all tensors zeroed, with norm gains set to one.
    pub fn zeroed(cfg: ModelConfig) -> Self {
        let v = cfg.vocab as usize;
        let d = cfg.d_model as usize;
        let ff = cfg.d_ff as usize;
        let w1_cols = cfg.w1_cols();

        let layers = (0..cfg.n_layers)
            .map(|_| LayerWeights {
                wq: vec![0.0; d * d],
                wk: vec![0.0; d * d],
                wv: vec![0.0; d * d],
                wo: vec![0.0; d * d],
                w1: vec![0.0; d * w1_cols],
                b1: vec![0.0; w1_cols],
                w2: vec![0.0; ff * d],
                b2: vec![0.0; d],
                ln1_g: vec![1.0; d],
                ln1_b: vec![0.0; d],
                ln2_g: vec![1.0; d],
                ln2_b: vec![0.0; d],
            })
            .collect();

        Self {
            cfg,
            tok_emb: vec![0.0; v * d],
            lm_head: vec![0.0; d * v],
            ln_f_g: vec![1.0; d],
            ln_f_b: vec![0.0; d],
            layers,
        }
    }

    fn tensors(&self) -> Vec<&[f32]> {
        let mut t: Vec<&[f32]> = vec![&self.tok_emb];
        for l in &self.layers {
            t.extend([
                l.wq.as_slice(),
                l.wk.as_slice(),
                l.wv.as_slice(),
                l.wo.as_slice(),
                l.w1.as_slice(),
                l.b1.as_slice(),
                l.w2.as_slice(),
                l.b2.as_slice(),
                l.ln1_g.as_slice(),
                l.ln1_b.as_slice(),
                l.ln2_g.as_slice(),
                l.ln2_b.as_slice(),
            ]);
        }
        t.extend([self.ln_f_g.as_slice(), self.ln_f_b.as_slice(), self.lm_head.as_slice()]);
        t
    }

    fn tensors_mut(&mut self) -> Vec<&mut Vec<f32>> {
        let mut t: Vec<&mut Vec<f32>> = vec![&mut self.tok_emb];
        for l in &mut self.layers {
            t.extend([
                &mut l.wq,
                &mut l.wk,
                &mut l.wv,
                &mut l.wo,
                &mut l.w1,
                &mut l.b1,
                &mut l.w2,
                &mut l.b2,
                &mut l.ln1_g,
                &mut l.ln1_b,
                &mut l.ln2_g,
                &mut l.ln2_b,
            ]);
        }
        t.extend([&mut self.ln_f_g, &mut self.ln_f_b, &mut self.lm_head]);
        t
    }

    /// Parse a full weight file (header plus optional payload).
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ModelError> {
        let (cfg, header_len) = decode_header(buf)?;
        let payload = &buf[header_len..];
        let mut weights = Self::zeroed(cfg);

        if payload.is_empty() {
            return Ok(weights);
        }
        let expected = cfg.f32_count() * 4;
        if payload.len() != expected {
            return Err(ModelError::InvalidModel(format!(
                "payload is {} bytes, expected {expected} or none",
                payload.len()
            )));
        }

        let mut at = 0;
        for tensor in weights.tensors_mut() {
            for slot in tensor.iter_mut() {
                *slot = f32::from_le_bytes(payload[at..at + 4].try_into().expect("4 bytes"));
                at += 4;
            }
        }
        Ok(weights)
    }

    /// Emit the header and the full tensor payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = encode_header(&self.cfg);
        out.reserve(self.cfg.f32_count() * 4);
        for tensor in self.tensors() {
            for v in tensor {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        out
    }

    /// Load weights from a file on disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// Write header and payload to a file on disk.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }
}
