//! Document id generation

use crate::core_doc::document::DocId;
use crate::core_doc::errors::{DocError, DocResult};
use rand::Rng;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

const UNMISTAKABLE_CHARS: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTWXYZabcdefghijkmnopqrstuvwxyz";
const STRING_ID_LEN: usize = 17;

/// How a collection mints ids for documents inserted without one
#[derive(Clone, Default)]
pub enum IdGeneration {
    /// 17 characters from an alphabet without look-alike glyphs
    #[default]
    String,
    /// 24 lowercase hex characters (12 random bytes)
    Mongo,
    /// Caller-supplied generator
    Custom(Arc<dyn Fn() -> String + Send + Sync>),
}

impl IdGeneration {
    pub fn generate(&self) -> DocId {
        match self {
            IdGeneration::String => {
                let mut rng = rand::rng();
                let id: String = (0..STRING_ID_LEN)
                    .map(|_| UNMISTAKABLE_CHARS[rng.random_range(0..UNMISTAKABLE_CHARS.len())] as char)
                    .collect();
                DocId(id)
            }
            IdGeneration::Mongo => {
                let mut bytes = [0u8; 12];
                rand::rng().fill(&mut bytes);
                DocId(hex::encode(bytes))
            }
            IdGeneration::Custom(f) => DocId(f()),
        }
    }
}

impl fmt::Debug for IdGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdGeneration::String => f.write_str("String"),
            IdGeneration::Mongo => f.write_str("Mongo"),
            IdGeneration::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl FromStr for IdGeneration {
    type Err = DocError;

    fn from_str(s: &str) -> DocResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "STRING" => Ok(IdGeneration::String),
            "MONGO" => Ok(IdGeneration::Mongo),
            _ => Err(DocError::UnknownIdGeneration(s.to_string())),
        }
    }
}
