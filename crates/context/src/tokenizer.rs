//! Tokenizer encoders and the process-scoped encoder cache.
//!
//! Encoders are created lazily, one per encoding key, and shared by every
//! caller. Native BPE state grows with use, so the whole cache is dropped
//! after [`RESET_THRESHOLD`] encode calls and rebuilt on demand. An encode
//! failure also flushes the cache and retries exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use parley_core::ModelProfile;
use parley_core::TokenizationError;
use parley_core::model::{IM_END, IM_START};
use tiktoken_rs::CoreBPE;
use tracing::{debug, warn};

/// Encode calls between two full cache flushes.
pub const RESET_THRESHOLD: usize = 25;

/// Canonical encoding for chat-completion models.
pub const CHAT_ENCODING: &str = "cl100k_base";

/// Chat encoding extended with the `<|im_start|>` / `<|im_end|>` turn markers.
pub const CHAT_IM_ENCODING: &str = "cl100k_im";

/// Model whose encoding is used when a model name cannot be resolved.
pub const LEGACY_MODEL: &str = "text-davinci-003";

/// Reserved ids for the turn markers, outside the cl100k vocabulary.
pub const IM_START_ID: usize = 100_264;
pub const IM_END_ID: usize = 100_265;

// ── Encoders ──────────────────────────────────────────────────────────────

/// A text encoder bound to one encoding.
pub trait TokenEncoder: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<usize>, String>;

    fn decode(&self, tokens: &[usize]) -> Result<String, String>;
}

/// Which encoding a model's text is counted with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EncodingSelector {
    /// All chat-completion models share one encoding.
    Chat,
    /// Chat encoding plus the two reserved turn markers.
    ChatIm,
    /// Encoding named after a model; unknown names fall back to [`LEGACY_MODEL`].
    Model(String),
}

impl EncodingSelector {
    pub fn for_profile(profile: &ModelProfile) -> Self {
        if profile.is_chat_completion {
            Self::Chat
        } else if profile.is_unofficial_chat_model {
            Self::ChatIm
        } else if profile.model().contains("instruct") {
            Self::legacy()
        } else {
            Self::Model(profile.model().to_string())
        }
    }

    pub fn legacy() -> Self {
        Self::Model(LEGACY_MODEL.to_string())
    }

    /// Cache key.
    pub fn key(&self) -> &str {
        match self {
            Self::Chat => CHAT_ENCODING,
            Self::ChatIm => CHAT_IM_ENCODING,
            Self::Model(name) => name,
        }
    }

    fn may_fall_back(&self) -> bool {
        matches!(self, Self::Model(name) if name != LEGACY_MODEL)
    }
}

/// Builds encoders on cache misses. Injected so tests can observe lifecycle.
pub trait EncoderFactory: Send + Sync {
    fn create(&self, selector: &EncodingSelector) -> Result<Arc<dyn TokenEncoder>, TokenizationError>;
}

/// Factory backed by the BPE tables bundled with `tiktoken-rs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TiktokenFactory;

impl EncoderFactory for TiktokenFactory {
    fn create(&self, selector: &EncodingSelector) -> Result<Arc<dyn TokenEncoder>, TokenizationError> {
        let unavailable = |reason: String| TokenizationError::EncoderUnavailable {
            encoding: selector.key().to_string(),
            reason,
        };

        match selector {
            EncodingSelector::Chat => {
                let bpe = tiktoken_rs::cl100k_base().map_err(|e| unavailable(e.to_string()))?;
                Ok(Arc::new(BpeEncoder { bpe }))
            }
            EncodingSelector::ChatIm => {
                let bpe = tiktoken_rs::cl100k_base().map_err(|e| unavailable(e.to_string()))?;
                Ok(Arc::new(ImMarkedEncoder { bpe }))
            }
            EncodingSelector::Model(model) => {
                let bpe =
                    tiktoken_rs::get_bpe_from_model(model).map_err(|e| unavailable(e.to_string()))?;
                Ok(Arc::new(BpeEncoder { bpe }))
            }
        }
    }
}

struct BpeEncoder {
    bpe: CoreBPE,
}

impl TokenEncoder for BpeEncoder {
    fn encode(&self, text: &str) -> Result<Vec<usize>, String> {
        Ok(self.bpe.encode_with_special_tokens(text))
    }

    fn decode(&self, tokens: &[usize]) -> Result<String, String> {
        self.bpe.decode(tokens.to_vec()).map_err(|e| e.to_string())
    }
}

/// cl100k with `<|im_start|>` and `<|im_end|>` as single reserved tokens.
struct ImMarkedEncoder {
    bpe: CoreBPE,
}

impl ImMarkedEncoder {
    const MARKERS: [(&'static str, usize); 2] = [(IM_START, IM_START_ID), (IM_END, IM_END_ID)];
}

impl TokenEncoder for ImMarkedEncoder {
    fn encode(&self, text: &str) -> Result<Vec<usize>, String> {
        let mut tokens = Vec::new();
        let mut rest = text;
        loop {
            let next = Self::MARKERS
                .iter()
                .filter_map(|&(marker, id)| rest.find(marker).map(|idx| (idx, marker, id)))
                .min_by_key(|&(idx, _, _)| idx);

            match next {
                Some((idx, marker, id)) => {
                    tokens.extend(self.bpe.encode_with_special_tokens(&rest[..idx]));
                    tokens.push(id);
                    rest = &rest[idx + marker.len()..];
                }
                None => {
                    tokens.extend(self.bpe.encode_with_special_tokens(rest));
                    return Ok(tokens);
                }
            }
        }
    }

    fn decode(&self, tokens: &[usize]) -> Result<String, String> {
        let mut out = String::new();
        let mut run = Vec::new();
        for &token in tokens {
            let marker = Self::MARKERS.iter().find(|&&(_, id)| id == token);
            match marker {
                Some(&(marker, _)) => {
                    if !run.is_empty() {
                        let text = self
                            .bpe
                            .decode(std::mem::take(&mut run))
                            .map_err(|e| e.to_string())?;
                        out.push_str(&text);
                    }
                    out.push_str(marker);
                }
                None => run.push(token),
            }
        }
        if !run.is_empty() {
            out.push_str(&self.bpe.decode(run).map_err(|e| e.to_string())?);
        }
        Ok(out)
    }
}

// ── Cache ─────────────────────────────────────────────────────────────────

struct CacheState {
    encoders: HashMap<String, Arc<dyn TokenEncoder>>,
    calls: usize,
}

/// Process-scoped encoder cache.
///
/// Construct one at startup and share it behind an `Arc`. Flushing and
/// recreating an encoder is idempotent, so a flush racing a lookup is safe.
pub struct TokenizerCache {
    factory: Arc<dyn EncoderFactory>,
    reset_threshold: usize,
    state: Mutex<CacheState>,
    created: AtomicUsize,
    flushes: AtomicUsize,
}

impl Default for TokenizerCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TokenizerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("TokenizerCache")
            .field("reset_threshold", &self.reset_threshold)
            .field("cached", &state.encoders.keys().collect::<Vec<_>>())
            .field("calls", &state.calls)
            .finish()
    }
}

impl TokenizerCache {
    pub fn new() -> Self {
        Self::with_factory(Arc::new(TiktokenFactory))
    }

    pub fn with_factory(factory: Arc<dyn EncoderFactory>) -> Self {
        Self {
            factory,
            reset_threshold: RESET_THRESHOLD,
            state: Mutex::new(CacheState {
                encoders: HashMap::new(),
                calls: 0,
            }),
            created: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
        }
    }

    pub fn with_reset_threshold(mut self, threshold: usize) -> Self {
        self.reset_threshold = threshold.max(1);
        self
    }

    /// Number of tokens in `text` under the selected encoding.
    pub fn count(&self, text: &str, selector: &EncodingSelector) -> Result<usize, TokenizationError> {
        self.encode(text, selector).map(|tokens| tokens.len())
    }

    /// Encode `text`, flushing and retrying once if the encoder fails.
    pub fn encode(
        &self,
        text: &str,
        selector: &EncodingSelector,
    ) -> Result<Vec<usize>, TokenizationError> {
        self.reset_if_necessary();

        match self.try_encode(text, selector) {
            Ok(tokens) => Ok(tokens),
            Err(first) => {
                warn!(encoding = selector.key(), error = %first, "Encode failed, flushing tokenizer cache and retrying");
                self.flush();
                self.try_encode(text, selector)
            }
        }
    }

    /// Decode tokens. Does not advance the reset counter.
    pub fn decode(
        &self,
        tokens: &[usize],
        selector: &EncodingSelector,
    ) -> Result<String, TokenizationError> {
        let encoder = self.encoder(selector)?;
        encoder
            .decode(tokens)
            .map_err(|reason| TokenizationError::DecodeFailed {
                encoding: selector.key().to_string(),
                reason,
            })
    }

    /// Split `text` into consecutive chunks of about `chunk_size` tokens.
    ///
    /// A chunk boundary that falls inside a multi-byte character is moved
    /// forward until the chunk decodes cleanly.
    pub fn split(
        &self,
        text: &str,
        selector: &EncodingSelector,
        chunk_size: usize,
    ) -> Result<Vec<String>, TokenizationError> {
        let tokens = self.encode(text, selector)?;
        let chunk_size = chunk_size.max(1);
        let mut chunks = Vec::new();
        let mut start = 0;

        while start < tokens.len() {
            let mut end = (start + chunk_size).min(tokens.len());
            let chunk = loop {
                match self.decode(&tokens[start..end], selector) {
                    Ok(chunk) => break chunk,
                    // A UTF-8 character spans at most four bytes
                    Err(_) if end < tokens.len() && end < start + chunk_size + 3 => end += 1,
                    Err(e) => return Err(e),
                }
            };
            chunks.push(chunk);
            start = end;
        }

        Ok(chunks)
    }

    /// Drop every cached encoder and restart the call counter.
    pub fn flush(&self) {
        let mut state = self.lock();
        state.encoders.clear();
        state.calls = 1;
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// Encoders created since construction.
    pub fn encoders_created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Full flushes since construction.
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn cached_encodings(&self) -> usize {
        self.lock().encoders.len()
    }

    pub fn reset_threshold(&self) -> usize {
        self.reset_threshold
    }

    fn reset_if_necessary(&self) {
        let calls = {
            let mut state = self.lock();
            if state.calls >= self.reset_threshold {
                state.encoders.clear();
                state.calls = 1;
                self.flushes.fetch_add(1, Ordering::Relaxed);
                debug!(threshold = self.reset_threshold, "Tokenizer cache reached reset threshold, flushed all encoders");
            }
            state.calls += 1;
            state.calls
        };
        tracing::trace!(calls, "Tokenizer call");
    }

    fn try_encode(
        &self,
        text: &str,
        selector: &EncodingSelector,
    ) -> Result<Vec<usize>, TokenizationError> {
        let encoder = self.encoder(selector)?;
        encoder
            .encode(text)
            .map_err(|reason| TokenizationError::EncodeFailed {
                encoding: selector.key().to_string(),
                reason,
            })
    }

    fn encoder(&self, selector: &EncodingSelector) -> Result<Arc<dyn TokenEncoder>, TokenizationError> {
        if let Some(encoder) = self.lock().encoders.get(selector.key()) {
            return Ok(Arc::clone(encoder));
        }

        let encoder = match self.factory.create(selector) {
            Ok(encoder) => encoder,
            Err(e) if selector.may_fall_back() => {
                debug!(model = selector.key(), error = %e, "Unknown model encoding, using {LEGACY_MODEL}");
                self.factory.create(&EncodingSelector::legacy())?
            }
            Err(e) => return Err(e),
        };
        self.created.fetch_add(1, Ordering::Relaxed);

        let mut state = self.lock();
        let cached = state
            .encoders
            .entry(selector.key().to_string())
            .or_insert(encoder);
        Ok(Arc::clone(cached))
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────
