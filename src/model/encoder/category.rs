//! Category encoder.
//!
//! Maps a category label to a one-hot token (unit value at `index % d_model`).
//! The index comes from a fitted label mapping when one was loaded, otherwise
//! from a stable hash of the lowercased label. Neither path can fail: unknown
//! labels resolve to a fixed default index.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

use crate::model::tokens::{EncodingResult, TokenEmbedding, TokenRole};
use crate::Result;

/// Modulus applied to the label hash in fallback mode.
pub const HASH_BUCKETS: u64 = 100;

/// Categories reported when no fitted encoder is available.
pub const FALLBACK_CATEGORIES: [&str; 19] = [
    "accessories",
    "appliances",
    "automotive",
    "baby",
    "beauty",
    "books",
    "car & motorbike",
    "computers",
    "electronics",
    "fashion",
    "grocery",
    "health & personal care",
    "home & kitchen",
    "music",
    "pet supplies",
    "sports",
    "toys & games",
    "tv, audio & cameras",
    "video games",
];

/// On-disk form of a fitted encoder: class index = position in `classes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FittedFile {
    classes: Vec<String>,
}

/// A label-to-index mapping learned from training data.
#[derive(Debug, Clone, PartialEq)]
pub struct FittedCategories {
    classes: Vec<String>,
    index: HashMap<String, usize>,
}

impl FittedCategories {
    pub fn new(classes: Vec<String>) -> Self {
        let index = classes
            .iter()
            .enumerate()
            .map(|(i, class)| (normalize_label(class), i))
            .collect();
        Self { classes, index }
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// Index used for labels the mapping has never seen: the class-count midpoint.
    pub fn default_index(&self) -> usize {
        self.classes.len() / 2
    }

    pub fn lookup(&self, label: &str) -> Option<usize> {
        self.index.get(&normalize_label(label)).copied()
    }
}

/// Category encoder state, resolved once at load time.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CategoryEncoderState {
    Fitted(FittedCategories),
    #[default]
    Absent,
}

impl CategoryEncoderState {
    /// Load a fitted encoder from `path`.
    ///
    /// A missing, unreadable, malformed, or empty file yields [`Self::Absent`];
    /// category encoding then uses the hash fallback.
    pub fn load_or_absent(path: &Path) -> Self {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no fitted category encoder, using hash fallback");
            return Self::Absent;
        }
        match read_fitted(path) {
            Ok(fitted) if !fitted.classes.is_empty() => {
                tracing::info!(classes = fitted.classes.len(), "loaded fitted category encoder");
                Self::Fitted(fitted)
            }
            Ok(_) => {
                tracing::warn!(path = %path.display(), "category encoder has no classes, using hash fallback");
                Self::Absent
            }
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "could not read category encoder, using hash fallback");
                Self::Absent
            }
        }
    }

    /// Persist a fitted mapping. [`Self::Absent`] writes nothing.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Self::Fitted(fitted) = self {
            let file = FittedFile {
                classes: fitted.classes.clone(),
            };
            std::fs::write(path, serde_json::to_string_pretty(&file)?)?;
        }
        Ok(())
    }

    /// Known labels, sorted.
    pub fn available_categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = match self {
            Self::Fitted(fitted) => fitted.classes.clone(),
            Self::Absent => FALLBACK_CATEGORIES.iter().map(|c| c.to_string()).collect(),
        };
        categories.sort();
        categories
    }

    /// Resolve a label to its class index and whether a fallback produced it.
    pub fn resolve_index(&self, label: &str) -> (usize, bool) {
        match self {
            Self::Fitted(fitted) => match fitted.lookup(label) {
                Some(idx) => (idx, false),
                None => (fitted.default_index(), true),
            },
            Self::Absent => (hash_index(label), true),
        }
    }

    /// Encode a label as a one-hot `d_model`-wide token.
    pub fn encode(&self, label: &str, d_model: usize) -> EncodingResult {
        let (idx, used_fallback) = self.resolve_index(label);
        let mut values = vec![0f32; d_model];
        values[idx % d_model] = 1.0;
        if used_fallback {
            tracing::debug!(label, idx, "category resolved via fallback");
        }
        let embedding = TokenEmbedding::new(TokenRole::Category, values);
        EncodingResult {
            embedding,
            used_fallback,
        }
    }
}

fn read_fitted(path: &Path) -> Result<FittedCategories> {
    let text = std::fs::read_to_string(path)?;
    let file: FittedFile = serde_json::from_str(&text)?;
    Ok(FittedCategories::new(file.classes))
}

fn normalize_label(label: &str) -> String {
    label.trim().to_lowercase()
}

/// `xxh64(trim(lowercase(label))) % 100`, stable across processes and platforms.
pub fn hash_index(label: &str) -> usize {
    (xxh64(normalize_label(label).as_bytes(), 0) % HASH_BUCKETS) as usize
}
