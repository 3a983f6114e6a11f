use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter};
use std::path::Path;

use crate::error::{Result, TokenizerError};
use crate::vocab::Vocab;
use crate::{SpecialTokens, Tokenizer};

const PRETOKENIZE_PATTERN: &str =
    r"'s|'t|'re|'ve|'m|'ll|'d| ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+";

/// On-disk form: merges are stored as ordered pairs, rank = index.
#[derive(Serialize, Deserialize)]
struct TokenizerFile {
    vocab: Vocab,
    merges: Vec<(String, String)>,
}

/// Byte-pair encoder over a fixed vocabulary and merge table.
///
/// Pieces that are not in the vocabulary fall back to `<0xNN>` byte tokens
/// and then to `<unk>`.
pub struct BpeTokenizer {
    vocab: Vocab,
    merges: HashMap<(String, String), u32>,
    special: SpecialTokens,
    regex: Regex,
}

impl std::fmt::Debug for BpeTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BpeTokenizer")
            .field("vocab_size", &self.vocab.len())
            .field("merges_count", &self.merges.len())
            .field("special", &self.special)
            .finish()
    }
}

impl BpeTokenizer {
    /// The vocabulary must contain `<pad>`, `<bos>`, `<eos>` and `<unk>`.
    pub fn new(vocab: Vocab, merges: HashMap<(String, String), u32>) -> Result<Self> {
        let lookup = |name: &str| {
            vocab
                .get_id(name)
                .ok_or_else(|| TokenizerError::MissingSpecialToken(name.to_string()))
        };
        let special = SpecialTokens {
            pad: lookup(SpecialTokens::PAD)?,
            bos: lookup(SpecialTokens::BOS)?,
            eos: lookup(SpecialTokens::EOS)?,
            unk: lookup(SpecialTokens::UNK)?,
        };
        Ok(Self {
            vocab,
            merges,
            special,
            regex: Regex::new(PRETOKENIZE_PATTERN)?,
        })
    }

    /// Loads `vocab.json` and a `merges.txt` with one `left right` pair per
    /// line, ranked by order of appearance.
    pub fn from_files<P: AsRef<Path>>(vocab_path: P, merges_path: P) -> Result<Self> {
        let vocab = Vocab::load(vocab_path)?;
        let reader = BufReader::new(File::open(merges_path)?);

        let mut merges = HashMap::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.starts_with('#') || line.trim().is_empty() {
                continue;
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() != 2 {
                return Err(TokenizerError::MalformedMerge {
                    line: i + 1,
                    content: line,
                });
            }
            let rank = merges.len() as u32;
            merges.insert((parts[0].to_string(), parts[1].to_string()), rank);
        }

        tracing::debug!(vocab = vocab.len(), merges = merges.len(), "loaded tokenizer files");
        Self::new(vocab, merges)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut ranked: Vec<_> = self.merges.iter().collect();
        ranked.sort_by_key(|&(_, rank)| *rank);
        let file = TokenizerFile {
            vocab: self.vocab.clone(),
            merges: ranked.into_iter().map(|(pair, _)| pair.clone()).collect(),
        };
        serde_json::to_writer_pretty(BufWriter::new(File::create(path)?), &file)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file: TokenizerFile = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        let merges = file
            .merges
            .into_iter()
            .enumerate()
            .map(|(rank, pair)| (pair, rank as u32))
            .collect();
        Self::new(file.vocab, merges)
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    fn bpe(&self, piece: &str) -> Vec<String> {
        let mut word: Vec<String> = piece.chars().map(|c| c.to_string()).collect();

        while word.len() > 1 {
            let best = word
                .windows(2)
                .enumerate()
                .filter_map(|(i, pair)| {
                    self.merges
                        .get(&(pair[0].clone(), pair[1].clone()))
                        .map(|&rank| (rank, i))
                })
                .min();
            let Some((_, first_idx)) = best else {
                break;
            };

            let (first, second) = (word[first_idx].clone(), word[first_idx + 1].clone());
            let mut merged = Vec::with_capacity(word.len());
            let mut i = 0;
            while i < word.len() {
                if i + 1 < word.len() && word[i] == first && word[i + 1] == second {
                    merged.push(format!("{}{}", first, second));
                    i += 2;
                } else {
                    merged.push(word[i].clone());
                    i += 1;
                }
            }
            word = merged;
        }

        word
    }

    fn byte_token(token: &str) -> Option<u8> {
        let hex = token.strip_prefix("<0x")?.strip_suffix('>')?;
        if hex.len() != 2 {
            return None;
        }
        u8::from_str_radix(hex, 16).ok()
    }
}

impl Tokenizer for BpeTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        let mut ids = Vec::new();
        for mat in self.regex.find_iter(text) {
            for token in self.bpe(mat.as_str()) {
                if let Some(id) = self.vocab.get_id(&token) {
                    ids.push(id);
                    continue;
                }
                for byte in token.bytes() {
                    let id = self
                        .vocab
                        .get_id(&format!("<0x{:02X}>", byte))
                        .unwrap_or(self.special.unk);
                    ids.push(id);
                }
            }
        }
        ids
    }

    fn decode(&self, ids: &[u32]) -> String {
        let mut bytes = Vec::new();
        for &id in ids {
            if self.special.is_control(id) {
                continue;
            }
            match self.vocab.get_token(id) {
                Some(token) => match Self::byte_token(token) {
                    Some(byte) => bytes.push(byte),
                    None => bytes.extend_from_slice(token.as_bytes()),
                },
                None => tracing::warn!(id, "token id not in vocabulary"),
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn special_tokens(&self) -> &SpecialTokens {
        &self.special
    }

    fn vocab_size(&self) -> usize {
        self.vocab.len()
    }
}
