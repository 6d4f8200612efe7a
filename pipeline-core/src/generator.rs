//! The text-generator layer (spec §2.6, §6): the only component in this
//! crate that knows about text. Encodes a prompt via the external
//! tokenizer collaborator, drives the pipeline's token stream, and decodes
//! accumulated ids back to text at every step, surfacing the per-token
//! latency the pipeline already computed.

use std::path::Path;
use std::pin::Pin;

use async_stream::try_stream;
use futures_core::Stream;

use crate::error::PipelineError;
use crate::pipeline::Pipeline;

/// The tokenizer capability the pipeline's external collaborator provides
/// (spec §1, "Out of scope... the tokenizer (a `Tokenize(text)→ids` /
/// `Detokenize(ids)→text` capability)"). Kept as a trait so tests and
/// alternate tokenizer backends never need the `tokenizers` crate.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>>;
    fn decode(&self, ids: &[u32]) -> anyhow::Result<String>;
}

/// Wraps a HuggingFace `tokenizers::Tokenizer` loaded from a `tokenizer.json`
/// file, the conventional sidecar the spec's on-disk layout allows for
/// (spec §6, "optionally, a tokenizer descriptor").
pub struct HfTokenizer(tokenizers::Tokenizer);

impl HfTokenizer {
    pub fn from_file(path: &Path) -> Result<Self, PipelineError> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| PipelineError::TokenizerUnavailable(e.to_string()))?;
        Ok(Self(inner))
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>> {
        let encoding = self
            .0
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("tokenizer encode failed: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> anyhow::Result<String> {
        self.0
            .decode(ids, true)
            .map_err(|e| anyhow::anyhow!("tokenizer decode failed: {e}"))
    }
}

/// One decoded step of generation: the pipeline's `Prediction`, translated
/// into text (spec §3, "Prediction record").
#[derive(Debug, Clone)]
pub struct TextPrediction {
    pub token_id: u32,
    pub token_text: String,
    pub text_so_far: String,
    pub latency_ms: f64,
    pub prompt_latency_ms: Option<f64>,
}

/// Thin text capability on top of a `Pipeline` (spec §2, item 6).
pub struct TextGenerator<'p> {
    pipeline: &'p mut Pipeline,
    tokenizer: &'p dyn Tokenizer,
}

impl<'p> TextGenerator<'p> {
    pub fn new(pipeline: &'p mut Pipeline, tokenizer: &'p dyn Tokenizer) -> Self {
        Self { pipeline, tokenizer }
    }

    /// Encode `prompt`, drive the pipeline, and decode every emitted token
    /// back to text as it arrives.
    pub fn generate(
        &mut self,
        prompt: &str,
        max_new_tokens: usize,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<TextPrediction, PipelineError>> + Send + '_>>, PipelineError> {
        let prompt_ids = self
            .tokenizer
            .encode(prompt)
            .map_err(|e| PipelineError::TokenizerUnavailable(e.to_string()))?;

        let tokenizer = self.tokenizer;
        let mut predictions = self.pipeline.predict(prompt_ids, max_new_tokens);

        let stream = try_stream! {
            use futures_util::StreamExt;

            while let Some(item) = predictions.next().await {
                let prediction = item?;
                let token_text = tokenizer
                    .decode(&[prediction.new_token])
                    .map_err(|e| PipelineError::TokenizerUnavailable(e.to_string()))?;
                let text_so_far = tokenizer
                    .decode(&prediction.all_tokens)
                    .map_err(|e| PipelineError::TokenizerUnavailable(e.to_string()))?;
                yield TextPrediction {
                    token_id: prediction.new_token,
                    token_text,
                    text_so_far,
                    latency_ms: prediction.latency_ms,
                    prompt_latency_ms: prediction.prompt_latency_ms,
                };
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A byte-identity tokenizer: encodes each ASCII byte as its own id,
    /// decodes the same way. Avoids pulling in a real vocabulary file for
    /// unit tests of the generator plumbing itself.
    struct ByteTokenizer;

    impl Tokenizer for ByteTokenizer {
        fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>> {
            Ok(text.bytes().map(|b| b as u32).collect())
        }

        fn decode(&self, ids: &[u32]) -> anyhow::Result<String> {
            let bytes: Vec<u8> = ids.iter().map(|&id| id as u8).collect();
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
    }

    #[test]
    fn byte_tokenizer_round_trips() {
        let tok = ByteTokenizer;
        let ids = tok.encode("hi").unwrap();
        assert_eq!(ids, vec![b'h' as u32, b'i' as u32]);
        assert_eq!(tok.decode(&ids).unwrap(), "hi");
    }
}
