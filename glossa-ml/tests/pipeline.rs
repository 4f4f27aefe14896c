use std::path::Path;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{Init, VarBuilder, VarMap};
use glossa_ml::gemma3::{Gemma3Config, Gemma3Model};
use glossa_ml::{
    ChatMessage, GenerateOptions, LanguageCode, LoadOptions, PipelineError, VlmPipeline,
};
use image::{DynamicImage, Rgb, RgbImage};

// Ids of the fixture vocabulary below.
const EOT: u32 = 4;
const HELLO: u32 = 5;
const WORLD: u32 = 6;
const EOI: u32 = 8;
const FOO: u32 = 10;
const BAR: u32 = 11;
const VOCAB: usize = 12;

const CONFIG_JSON: &str = r#"{
  "mm_tokens_per_image": 4,
  "image_token_index": 9,
  "boi_token_index": 7,
  "eoi_token_index": 8,
  "text_config": {
    "vocab_size": 12,
    "hidden_size": 12,
    "intermediate_size": 8,
    "num_hidden_layers": 2,
    "num_attention_heads": 2,
    "num_key_value_heads": 1,
    "head_dim": 4,
    "query_pre_attn_scalar": 4.0,
    "sliding_window": 4,
    "sliding_window_pattern": 2
  },
  "vision_config": {
    "hidden_size": 4,
    "intermediate_size": 8,
    "num_hidden_layers": 1,
    "num_attention_heads": 1,
    "image_size": 8,
    "patch_size": 2
  }
}"#;

const TOKENIZER_JSON: &str = r#"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [
    {"id": 0, "content": "<pad>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
    {"id": 1, "content": "<eos>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
    {"id": 2, "content": "<bos>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
    {"id": 3, "content": "<unk>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
    {"id": 4, "content": "<end_of_turn>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
    {"id": 7, "content": "<start_of_image>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
    {"id": 8, "content": "<end_of_image>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
    {"id": 9, "content": "<image_soft_token>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
  ],
  "normalizer": null,
  "pre_tokenizer": {"type": "Whitespace"},
  "post_processor": null,
  "decoder": null,
  "model": {
    "type": "WordLevel",
    "vocab": {
      "<pad>": 0, "<eos>": 1, "<bos>": 2, "<unk>": 3, "<end_of_turn>": 4,
      "hello": 5, "world": 6, "<start_of_image>": 7, "<end_of_image>": 8,
      "<image_soft_token>": 9, "foo": 10, "bar": 11
    },
    "unk_token": "<unk>"
  }
}"#;

const TEMPLATE: &str = "{{ bos_token }}{% for message in messages %}{% for item in message['content'] %}{% if item['type'] == 'text' %}{{ item['text'] }}{% else %}<start_of_image>{% endif %}{% endfor %}{% endfor %}";

const EMBED_TOKENS: &str = "language_model.model.embed_tokens.weight";
const LM_HEAD: &str = "language_model.lm_head.weight";

/// Greedy successor of each token in the fixture model.
fn successor(token: u32) -> u32 {
    match token {
        HELLO => WORLD,
        WORLD => FOO,
        FOO => EOT,
        EOI => HELLO,
        _ => BAR,
    }
}

/// `(rows, cols)` matrix with a one at every `(row, col)` in `ones`.
fn indicator(ones: impl IntoIterator<Item = (usize, usize)>, device: &Device) -> Result<Tensor> {
    let mut values = vec![0f32; VOCAB * VOCAB];
    for (row, col) in ones {
        values[row * VOCAB + col] = 1.0;
    }
    Ok(Tensor::from_vec(values, (VOCAB, VOCAB), device)?)
}

/// Writes a checkpoint whose every layer is zero, so the hidden state of a
/// token is its own one-hot embedding and the logits follow [`successor`].
fn write_weights(dir: &Path) -> Result<()> {
    let device = Device::Cpu;
    let cfg: Gemma3Config = serde_json::from_str(CONFIG_JSON)?;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    vb.get_with_hints((VOCAB, VOCAB), EMBED_TOKENS, Init::Const(0.))?;
    vb.get_with_hints((VOCAB, VOCAB), LM_HEAD, Init::Const(0.))?;
    Gemma3Model::new(&cfg, 16, vb)?;

    let embeddings = indicator((0..VOCAB).map(|i| (i, i)), &device)?;
    let lm_head = indicator(
        (0..VOCAB).map(|i| (successor(i as u32) as usize, i)),
        &device,
    )?;
    {
        let vars = varmap.data().lock().unwrap();
        for (name, var) in vars.iter() {
            let value = match name.as_str() {
                EMBED_TOKENS => embeddings.clone(),
                LM_HEAD => lm_head.clone(),
                _ => var.zeros_like()?,
            };
            var.set(&value)?;
        }
    }
    varmap.save(dir.join("model.safetensors"))?;
    Ok(())
}

fn fixture() -> Result<tempfile::TempDir> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("config.json"), CONFIG_JSON)?;
    std::fs::write(dir.path().join("tokenizer.json"), TOKENIZER_JSON)?;
    std::fs::write(dir.path().join("chat_template.jinja"), TEMPLATE)?;
    std::fs::write(
        dir.path().join("generation_config.json"),
        r#"{"eos_token_id": [1, 4]}"#,
    )?;
    write_weights(dir.path())?;
    Ok(dir)
}

fn load(dir: &Path, context_length: usize) -> Result<VlmPipeline> {
    VlmPipeline::load(dir, &Device::Cpu, &LoadOptions { context_length })
}

fn code(s: &str) -> LanguageCode {
    s.parse().unwrap()
}

fn opts(max_new_tokens: usize) -> GenerateOptions {
    GenerateOptions {
        max_new_tokens,
        ..Default::default()
    }
}

fn page() -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(5, 5, Rgb([255, 255, 255])))
}

#[test]
fn text_generation_stops_at_end_of_turn() -> Result<()> {
    let dir = fixture()?;
    let mut pipeline = load(dir.path(), 64)?;

    let messages = [ChatMessage::translate_text(code("en"), code("ja"), "hello")];
    let prompt = pipeline.render_prompt(&messages)?;
    assert_eq!(prompt, "<bos>hello");

    let output = pipeline.generate(&prompt, &[], &opts(16))?;
    assert_eq!(output, "world foo");
    Ok(())
}

#[test]
fn pipeline_can_generate_twice() -> Result<()> {
    let dir = fixture()?;
    let mut pipeline = load(dir.path(), 64)?;

    let first = pipeline.generate("<bos>hello", &[], &opts(16))?;
    let second = pipeline.generate("<bos>hello", &[], &opts(16))?;
    assert_eq!(first, "world foo");
    assert_eq!(second, first);
    Ok(())
}

#[test]
fn max_new_tokens_caps_output() -> Result<()> {
    let dir = fixture()?;
    let mut pipeline = load(dir.path(), 64)?;

    assert_eq!(pipeline.generate("<bos>bar", &[], &opts(3))?, "bar bar bar");
    assert_eq!(pipeline.generate("<bos>bar", &[], &opts(0))?, "");
    Ok(())
}

#[test]
fn image_features_fill_the_soft_token_block() -> Result<()> {
    let dir = fixture()?;
    let mut pipeline = load(dir.path(), 64)?;

    let messages = [ChatMessage::translate_image(
        code("de"),
        code("fr"),
        "sample_image.png",
    )];
    let prompt = pipeline.render_prompt(&messages)?;
    assert_eq!(prompt, "<bos><start_of_image>");
    assert_eq!(pipeline.prompt_tokens(&prompt)?, vec![2, 7, 9, 9, 9, 9, EOI]);

    let output = pipeline.generate(&prompt, &[page()], &opts(16))?;
    assert_eq!(output, "hello world foo");
    Ok(())
}

#[test]
fn marker_without_image_is_rejected() -> Result<()> {
    let dir = fixture()?;
    let mut pipeline = load(dir.path(), 64)?;

    let err = pipeline
        .generate("<bos><start_of_image>", &[], &opts(4))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::ImageCountMismatch {
            markers: 1,
            images: 0
        })
    ));
    Ok(())
}

#[test]
fn literal_soft_tokens_need_an_image() -> Result<()> {
    let dir = fixture()?;
    let mut pipeline = load(dir.path(), 64)?;

    let prompt = format!("<bos>{}hello", "<image_soft_token>".repeat(4));
    let err = pipeline.generate(&prompt, &[], &opts(4)).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::ImageCountMismatch {
            markers: 1,
            images: 0
        })
    ));
    Ok(())
}

#[test]
fn short_soft_token_run_is_rejected() -> Result<()> {
    let dir = fixture()?;
    let mut pipeline = load(dir.path(), 64)?;

    let err = pipeline
        .generate("<bos><image_soft_token>hello", &[], &opts(4))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::ImageTokenSpan {
            expected: 4,
            found: 1
        })
    ));
    Ok(())
}

#[test]
fn prompt_longer_than_context_overflows() -> Result<()> {
    let dir = fixture()?;
    let mut pipeline = load(dir.path(), 4)?;

    let err = pipeline
        .generate("<bos>hello world foo bar", &[], &opts(4))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::ContextOverflow {
            prompt: 5,
            limit: 4
        })
    ));
    Ok(())
}

#[test]
fn generation_stops_at_context_limit() -> Result<()> {
    let dir = fixture()?;
    let mut pipeline = load(dir.path(), 4)?;

    assert_eq!(pipeline.generate("<bos>bar", &[], &opts(16))?, "bar bar bar");
    Ok(())
}

#[test]
fn template_override_changes_model_input() -> Result<()> {
    let dir = fixture()?;
    let mut pipeline = load(dir.path(), 64)?;
    let messages = [ChatMessage::translate_text(code("en"), code("ja"), "hello")];

    let before = pipeline.render_prompt(&messages)?;
    assert_eq!(pipeline.prompt_tokens(&before)?, vec![2, HELLO]);

    pipeline.tokenizer_mut().set_chat_template(
        "{{ bos_token }}{% for message in messages %}{{ message['content'][0]['text'] }} world{% endfor %}",
    );
    let after = pipeline.render_prompt(&messages)?;
    assert_eq!(pipeline.prompt_tokens(&after)?, vec![2, HELLO, WORLD]);
    assert_eq!(pipeline.generate(&after, &[], &opts(16))?, "foo");
    Ok(())
}
