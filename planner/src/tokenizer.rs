use common::AppError;
use tiktoken_rs::CoreBPE;

/// Deterministic byte-pair tokenization keyed to a named scheme. Token identity is stable
/// across runs for a given scheme, so `raw_text_sha256` and chunk boundaries reproduce
/// exactly given the same input and config.
pub trait Tokenizer: Send + Sync {
    fn scheme(&self) -> &'static str;
    fn encode(&self, text: &str) -> Vec<usize>;
    fn decode(&self, tokens: &[usize]) -> Result<String, AppError>;
}

/// `cl100k_base`, the scheme named in the tokenizer contract.
pub struct Cl100kTokenizer {
    bpe: CoreBPE,
}

impl Cl100kTokenizer {
    pub fn new() -> Result<Self, AppError> {
        let bpe = tiktoken_rs::cl100k_base()
            .map_err(|e| AppError::Config(format!("failed to load cl100k_base tokenizer: {e}")))?;
        Ok(Self { bpe })
    }
}

impl Tokenizer for Cl100kTokenizer {
    fn scheme(&self) -> &'static str {
        "cl100k_base"
    }

    fn encode(&self, text: &str) -> Vec<usize> {
        self.bpe.encode_ordinary(text)
    }

    fn decode(&self, tokens: &[usize]) -> Result<String, AppError> {
        self.bpe
            .decode(tokens.to_vec())
            .map_err(|e| AppError::InternalError(format!("token decode failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips() {
        let tokenizer = Cl100kTokenizer::new().expect("tokenizer loads");
        let text = "Article 28 processor obligations.";
        let tokens = tokenizer.encode(text);
        assert!(!tokens.is_empty());
        let decoded = tokenizer.decode(&tokens).expect("decode succeeds");
        assert_eq!(decoded, text);
    }

    #[test]
    fn encoding_is_deterministic() {
        let tokenizer = Cl100kTokenizer::new().expect("tokenizer loads");
        let text = "gdpr ".repeat(50);
        assert_eq!(tokenizer.encode(&text), tokenizer.encode(&text));
    }
}
