use crate::GenerationParams;
use candle_core::{DType, Tensor};
use candle_transformers::generation::LogitsProcessor;

/// Token ids that end a caption: every EOS id of the checkpoint, plus the
/// pad token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StopTokens {
    eos: Vec<u32>,
    pad: Option<u32>,
}

impl StopTokens {
    pub fn new(eos: impl IntoIterator<Item = u32>, pad: Option<u32>) -> Self {
        Self {
            eos: eos.into_iter().collect(),
            pad,
        }
    }

    pub fn contains(&self, token_id: u32) -> bool {
        self.pad == Some(token_id) || self.eos.contains(&token_id)
    }
}

/// KV-cached autoregressive sampling.
///
/// `forward` maps `(1, seq_len, hidden)` embeddings at `index_pos` to the
/// logits of the last position, `embed` turns the sampled token into the next
/// `(1, 1, hidden)` input. Returns `prompt_ids` followed by the new tokens,
/// the stop token included.
pub(crate) fn sample_tokens(
    input_embeds: Tensor,
    prompt_ids: &[u32],
    params: &GenerationParams,
    stop_tokens: &StopTokens,
    mut forward: impl FnMut(&Tensor, usize) -> candle_core::Result<Tensor>,
    embed: impl Fn(u32) -> candle_core::Result<Tensor>,
) -> anyhow::Result<Vec<u32>> {
    let mut logits_processor = LogitsProcessor::from_sampling(params.seed(), params.sampling());
    let mut output_ids = prompt_ids.to_vec();

    let mut input = input_embeds;
    let mut index_pos = 0;
    for _ in 0..params.max_new_tokens {
        let (_, seq_len, _) = input.dims3()?;
        let logits = forward(&input, index_pos)?
            .squeeze(0)?
            .to_dtype(DType::F32)?;
        index_pos += seq_len;

        let next_token = logits_processor.sample(&logits)?;
        output_ids.push(next_token);
        if stop_tokens.contains(next_token) {
            break;
        }

        input = embed(next_token)?;
    }

    Ok(output_ids)
}
