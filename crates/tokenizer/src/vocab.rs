use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::error::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "HashMap<String, u32>", into = "HashMap<String, u32>")]
pub struct Vocab {
    token_to_id: HashMap<String, u32>,
    id_to_token: HashMap<u32, String>,
}

impl Vocab {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns ids `0..n` in iteration order.
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut vocab = Self::new();
        for (id, token) in tokens.into_iter().enumerate() {
            vocab.insert(token.into(), id as u32);
        }
        vocab
    }

    pub fn insert(&mut self, token: String, id: u32) {
        self.token_to_id.insert(token.clone(), id);
        self.id_to_token.insert(id, token);
    }

    pub fn get_id(&self, token: &str) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }

    pub fn get_token(&self, id: u32) -> Option<&str> {
        self.id_to_token.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.token_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_to_id.is_empty()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, &self.token_to_id)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let token_to_id: HashMap<String, u32> = serde_json::from_reader(reader)?;
        Ok(Self::from(token_to_id))
    }
}

impl From<HashMap<String, u32>> for Vocab {
    fn from(token_to_id: HashMap<String, u32>) -> Self {
        let id_to_token = token_to_id
            .iter()
            .map(|(token, &id)| (id, token.clone()))
            .collect();
        Self {
            token_to_id,
            id_to_token,
        }
    }
}

impl From<Vocab> for HashMap<String, u32> {
    fn from(vocab: Vocab) -> Self {
        vocab.token_to_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_follow_insertion_order() {
        let vocab = Vocab::from_tokens(["<pad>", "a", "b"]);
        assert_eq!(vocab.get_id("a"), Some(1));
        assert_eq!(vocab.get_token(2), Some("b"));
        assert_eq!(vocab.get_id("c"), None);
        assert_eq!(vocab.len(), 3);
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.json");
        let vocab = Vocab::from_tokens(["x", "y"]);
        vocab.save(&path).unwrap();

        let loaded = Vocab::load(&path).unwrap();
        assert_eq!(loaded.get_id("y"), Some(1));
        assert_eq!(loaded.get_token(0), Some("x"));
    }
}
