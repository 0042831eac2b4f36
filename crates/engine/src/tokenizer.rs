//! Tokenizer contract and the byte-level fallback.

/// Minimal tokenizer contract the sampler depends on. Any replacement must
/// keep these four operations.
pub trait Tokenizer {
    /// Total vocabulary size including special ids.
    fn vocab_size(&self) -> usize;
    /// Encode text to token ids.
    fn tokenize(&self, text: &str) -> Vec<u32>;
    /// Decode ids back to text, skipping special ids.
    fn decode(&self, ids: &[u32]) -> String;
    /// Whether `id` terminates generation.
    fn is_eos(&self, id: u32) -> bool;
}

/// Beginning-of-sequence id.
pub const BOS: u32 = 1;
/// End-of-sequence id.
pub const EOS: u32 = 2;
/// Unknown-token id.
pub const UNK: u32 = 3;

/// Byte-level fallback tokenizer: ids are raw byte values, with BOS=1,
/// EOS=2 and UNK=3 layered on top. The printable range is unambiguous but
/// bytes 1..=3 cannot round-trip. Vocabulary is 256 + 4.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl Tokenizer for ByteTokenizer {
    fn vocab_size(&self) -> usize {
        256 + 4
    }

    fn tokenize(&self, text: &str) -> Vec<u32> {
        let mut ids = Vec::with_capacity(text.len() + 1);
        ids.push(BOS);
        ids.extend(text.bytes().map(u32::from));
        ids
    }

    fn decode(&self, ids: &[u32]) -> String {
        let bytes: Vec<u8> = ids
            .iter()
            .filter(|&&id| !matches!(id, BOS | EOS | UNK))
            .filter_map(|&id| u8::try_from(id).ok())
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn is_eos(&self, id: u32) -> bool {
        id == EOS
    }
}
