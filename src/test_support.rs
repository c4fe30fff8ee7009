//! Tiny fixtures shared by unit tests: a small model config, seeded
//! transformer weights, and a miniature BERT with a word-level tokenizer.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use tokenizers::Tokenizer;

use crate::artifacts::{CHECKPOINT_FILE, MODEL_CONFIG_FILE, TEXT_MODEL_DIR};
use crate::config::{ModelConfig, PredictorConfig};
use crate::model::encoder::text::{BertTextEncoder, TextModelConfig};
use crate::model::transformer::{PriceTransformer, init};

pub const TINY_MAX_LENGTH: usize = 32;

const VOCAB: [&str; 20] = [
    "[PAD]", "[UNK]", "[CLS]", "[SEP]", "samsung", "galaxy", "s21", "5g", "smartphone", "nike",
    "air", "zoom", "running", "shoes", "harry", "potter", "complete", "book", "set", "phone",
];

pub fn small_model_config() -> ModelConfig {
    ModelConfig {
        d_model: 16,
        nhead: 2,
        num_layers: 2,
        ..ModelConfig::default()
    }
}

/// Seeded weights with the output bias overridden so predictions sit inside
/// the clamp range instead of on a rail.
pub fn seeded_weights(cfg: &ModelConfig, seed: u64, output_bias: f32) -> HashMap<String, Tensor> {
    let dev = Device::Cpu;
    let mut weights = init::initialize_weights(cfg, None, seed, &dev).unwrap();
    weights.insert(
        "price_head.4.bias".to_string(),
        Tensor::full(output_bias, 1, &dev).unwrap(),
    );
    weights
}

pub fn seeded_transformer(cfg: &ModelConfig, seed: u64, output_bias: f32) -> PriceTransformer {
    let vb = VarBuilder::from_tensors(seeded_weights(cfg, seed, output_bias), DType::F32, &Device::Cpu);
    PriceTransformer::new(cfg, vb).unwrap()
}

pub fn tiny_bert_config(hidden_size: usize) -> serde_json::Value {
    serde_json::json!({
        "vocab_size": VOCAB.len(),
        "hidden_size": hidden_size,
        "num_hidden_layers": 1,
        "num_attention_heads": 2,
        "intermediate_size": hidden_size * 2,
        "hidden_act": "gelu",
        "hidden_dropout_prob": 0.1,
        "max_position_embeddings": TINY_MAX_LENGTH,
        "type_vocab_size": 2,
        "initializer_range": 0.02,
        "layer_norm_eps": 1e-12,
        "pad_token_id": 0,
        "position_embedding_type": "absolute",
        "use_cache": false,
        "model_type": "bert"
    })
}

/// Lowercasing, whitespace-split word-level tokenizer with BERT's
/// `[CLS] $A [SEP]` template.
pub fn tiny_tokenizer() -> Tokenizer {
    let vocab: serde_json::Map<String, serde_json::Value> = VOCAB
        .iter()
        .enumerate()
        .map(|(i, w)| (w.to_string(), serde_json::json!(i)))
        .collect();
    let special = |id: u32, content: &str| {
        serde_json::json!({
            "id": id, "content": content, "single_word": false, "lstrip": false,
            "rstrip": false, "normalized": false, "special": true
        })
    };
    let definition = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [special(0, "[PAD]"), special(1, "[UNK]"), special(2, "[CLS]"), special(3, "[SEP]")],
        "normalizer": {"type": "Lowercase"},
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": {
            "type": "TemplateProcessing",
            "single": [
                {"SpecialToken": {"id": "[CLS]", "type_id": 0}},
                {"Sequence": {"id": "A", "type_id": 0}},
                {"SpecialToken": {"id": "[SEP]", "type_id": 0}}
            ],
            "pair": [
                {"SpecialToken": {"id": "[CLS]", "type_id": 0}},
                {"Sequence": {"id": "A", "type_id": 0}},
                {"SpecialToken": {"id": "[SEP]", "type_id": 0}},
                {"Sequence": {"id": "B", "type_id": 1}},
                {"SpecialToken": {"id": "[SEP]", "type_id": 1}}
            ],
            "special_tokens": {
                "[CLS]": {"id": "[CLS]", "ids": [2], "tokens": ["[CLS]"]},
                "[SEP]": {"id": "[SEP]", "ids": [3], "tokens": ["[SEP]"]}
            }
        },
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "[UNK]"}
    });
    Tokenizer::from_bytes(definition.to_string().as_bytes()).unwrap()
}

/// A randomly initialized tiny BERT whose parameters live in `varmap`.
pub fn tiny_text_encoder(varmap: &VarMap, hidden_size: usize, d_model: usize) -> BertTextEncoder {
    let dev = Device::Cpu;
    let vb = VarBuilder::from_varmap(varmap, DType::F32, &dev);
    let cfg = TextModelConfig::from_json(&tiny_bert_config(hidden_size).to_string()).unwrap();
    let projection = (hidden_size != d_model)
        .then(|| candle_nn::linear(hidden_size, d_model, vb.pp("text_projection")).unwrap());
    BertTextEncoder::new(&cfg, vb, tiny_tokenizer(), projection, d_model, TINY_MAX_LENGTH).unwrap()
}

/// Write a complete artifact directory for the small model config.
///
/// The checkpoint carries a `text_projection` only when `with_projection`.
pub fn write_artifacts(dir: &Path, text_hidden: usize, with_projection: bool) {
    let dev = Device::Cpu;
    let cfg = small_model_config();
    std::fs::write(dir.join(MODEL_CONFIG_FILE), serde_json::to_string(&cfg).unwrap()).unwrap();

    let mut weights = seeded_weights(&cfg, 9, 7.5);
    if with_projection {
        let full = init::initialize_weights(&cfg, Some(text_hidden), 9, &dev).unwrap();
        weights.insert("text_projection.weight".into(), full["text_projection.weight"].clone());
        weights.insert("text_projection.bias".into(), full["text_projection.bias"].clone());
    }
    init::save_checkpoint(&weights, DType::F32, &dir.join(CHECKPOINT_FILE)).unwrap();

    let text_dir = dir.join(TEXT_MODEL_DIR);
    std::fs::create_dir_all(&text_dir).unwrap();
    std::fs::write(text_dir.join("config.json"), tiny_bert_config(text_hidden).to_string()).unwrap();
    tiny_tokenizer().save(text_dir.join("tokenizer.json"), false).unwrap();
    // Building the encoder populates the varmap.
    let varmap = VarMap::new();
    let _ = tiny_text_encoder(&varmap, text_hidden, text_hidden);
    varmap.save(text_dir.join("model.safetensors")).unwrap();
}

/// Config that loads from `dir` and never touches the network.
pub fn offline_config(dir: &Path) -> PredictorConfig {
    PredictorConfig {
        artifact_dir: dir.to_path_buf(),
        allow_download: false,
        ..PredictorConfig::default()
    }
}
