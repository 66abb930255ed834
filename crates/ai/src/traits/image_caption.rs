use candle_transformers::generation::Sampling;

/// Image placeholder used when the processor configuration names none.
pub const DEFAULT_IMAGE_TOKEN: &str = "<image>";

pub type ImageCaptionOutput = String;

/// Decoding policy for a single caption.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    pub do_sample: bool,
    pub temperature: f64,
    pub top_p: Option<f64>,
    /// `0` disables top-k filtering.
    pub top_k: usize,
    pub pad_token_id: Option<u32>,
    pub seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 512,
            do_sample: true,
            temperature: 0.6,
            top_p: Some(0.9),
            top_k: 0,
            pad_token_id: None,
            seed: None,
        }
    }
}

impl GenerationParams {
    pub fn sampling(&self) -> Sampling {
        let temperature = self.temperature;
        if !self.do_sample || temperature <= 0. {
            return Sampling::ArgMax;
        }
        let top_k = (self.top_k > 0).then_some(self.top_k);
        match (top_k, self.top_p) {
            (None, None) => Sampling::All { temperature },
            (Some(k), None) => Sampling::TopK { k, temperature },
            (None, Some(p)) => Sampling::TopP { p, temperature },
            (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed.unwrap_or_else(rand::random)
    }
}

#[test]
fn test_default_sampling_is_top_p() {
    let params = GenerationParams::default();
    assert_eq!(params.max_new_tokens, 512);
    match params.sampling() {
        Sampling::TopP { p, temperature } => {
            assert_eq!(p, 0.9);
            assert_eq!(temperature, 0.6);
        }
        _ => panic!("expected top-p sampling"),
    }
}

#[test]
fn test_sampling_variants() {
    let greedy = GenerationParams {
        do_sample: false,
        ..Default::default()
    };
    assert!(matches!(greedy.sampling(), Sampling::ArgMax));

    let top_k = GenerationParams {
        top_k: 40,
        top_p: None,
        ..Default::default()
    };
    assert!(matches!(top_k.sampling(), Sampling::TopK { k: 40, .. }));

    let both = GenerationParams {
        top_k: 40,
        ..Default::default()
    };
    assert!(matches!(both.sampling(), Sampling::TopKThenTopP { k: 40, .. }));
}
