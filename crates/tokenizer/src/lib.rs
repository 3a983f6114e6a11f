pub mod bpe;
pub mod error;
pub mod vocab;

pub use bpe::BpeTokenizer;
pub use error::TokenizerError;
pub use vocab::Vocab;

/// Ids of the tokens with a structural meaning for generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub pad: u32,
    pub bos: u32,
    pub eos: u32,
    pub unk: u32,
}

impl SpecialTokens {
    pub const PAD: &'static str = "<pad>";
    pub const BOS: &'static str = "<bos>";
    pub const EOS: &'static str = "<eos>";
    pub const UNK: &'static str = "<unk>";

    /// Pad, bos and eos carry no text.
    pub fn is_control(&self, id: u32) -> bool {
        id == self.pad || id == self.bos || id == self.eos
    }
}

/// Text <-> token id codec used by the sampler.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<u32>;

    /// Control tokens (see [`SpecialTokens::is_control`]) are dropped.
    fn decode(&self, ids: &[u32]) -> String;

    fn special_tokens(&self) -> &SpecialTokens;

    fn vocab_size(&self) -> usize;
}
