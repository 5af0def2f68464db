use async_trait::async_trait;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokenizers::Tokenizer;

use crate::error::TokenCountError;
use crate::utils::content_hash;

/// Token counting is the only asynchronous boundary of the engine. Counts must
/// be deterministic for a given `(text, model_id)`.
#[async_trait]
pub trait TokenCounter: Send + Sync {
    async fn count_tokens(&self, text: &str, model_id: &str) -> Result<u32, TokenCountError>;
}

#[async_trait]
impl<T: TokenCounter + ?Sized> TokenCounter for Arc<T> {
    async fn count_tokens(&self, text: &str, model_id: &str) -> Result<u32, TokenCountError> {
        (**self).count_tokens(text, model_id).await
    }
}

/// Roughly four characters per token, rounded up.
#[derive(Debug, Clone, Copy, Default)]
pub struct EstimateTokenCounter;

#[async_trait]
impl TokenCounter for EstimateTokenCounter {
    async fn count_tokens(&self, text: &str, _model_id: &str) -> Result<u32, TokenCountError> {
        Ok(estimate_tokens(text))
    }
}

pub fn estimate_tokens(text: &str) -> u32 {
    ((text.chars().count() + 3) / 4) as u32
}

/// Counts with Hugging Face `tokenizer.json` files, per model id with an
/// optional fallback for models without their own tokenizer.
#[derive(Default)]
pub struct HfTokenCounter {
    tokenizers: HashMap<String, Tokenizer>,
    fallback: Option<Tokenizer>,
}

fn load_tokenizer(path: &Path) -> Result<Tokenizer, TokenCountError> {
    if !path.exists() {
        return Err(TokenCountError::Load(format!(
            "tokenizer not found at {}",
            path.display()
        )));
    }
    Tokenizer::from_file(path).map_err(|e| {
        TokenCountError::Load(format!("failed to load tokenizer from {:?}: {}", path, e))
    })
}

impl HfTokenCounter {
    /// One tokenizer used for every model.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TokenCountError> {
        Ok(Self {
            tokenizers: HashMap::new(),
            fallback: Some(load_tokenizer(path.as_ref())?),
        })
    }

    pub fn with_model(mut self, model_id: &str, path: impl AsRef<Path>) -> Result<Self, TokenCountError> {
        let tokenizer = load_tokenizer(path.as_ref())?;
        tracing::info!(target: "tokenizer", model_id, "loaded model tokenizer");
        self.tokenizers.insert(model_id.to_string(), tokenizer);
        Ok(self)
    }
}

#[async_trait]
impl TokenCounter for HfTokenCounter {
    async fn count_tokens(&self, text: &str, model_id: &str) -> Result<u32, TokenCountError> {
        let tokenizer = self
            .tokenizers
            .get(model_id)
            .or(self.fallback.as_ref())
            .ok_or_else(|| TokenCountError::UnknownModel(model_id.to_string()))?;

        let encoding = tokenizer
            .encode(text, false)
            .map_err(|e| TokenCountError::Encode(e.to_string()))?;
        Ok(encoding.get_ids().len() as u32)
    }
}

type CacheKey = (String, [u8; 32]);

/// Bounded memo of token counts keyed by model and content hash. Shared by
/// handing out `Arc<TokenCache>`; entries are only evicted by capacity.
pub struct TokenCache {
    inner: Mutex<LruCache<CacheKey, u32>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TokenCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, model_id: &str, text: &str) -> Option<u32> {
        let key = (model_id.to_string(), content_hash(text));
        let found = match self.inner.lock() {
            Ok(mut cache) => cache.get(&key).copied(),
            Err(_) => None,
        };
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    pub fn insert(&self, model_id: &str, text: &str, count: u32) {
        if let Ok(mut cache) = self.inner.lock() {
            cache.put((model_id.to_string(), content_hash(text)), count);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(hits, misses)` since creation.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }
}

pub struct CachedTokenCounter<C> {
    inner: C,
    cache: Arc<TokenCache>,
}

impl<C: TokenCounter> CachedTokenCounter<C> {
    pub fn new(inner: C, cache: Arc<TokenCache>) -> Self {
        Self { inner, cache }
    }

    pub fn cache(&self) -> &Arc<TokenCache> {
        &self.cache
    }
}

#[async_trait]
impl<C: TokenCounter> TokenCounter for CachedTokenCounter<C> {
    async fn count_tokens(&self, text: &str, model_id: &str) -> Result<u32, TokenCountError> {
        if let Some(count) = self.cache.get(model_id, text) {
            return Ok(count);
        }
        let count = self.inner.count_tokens(text, model_id).await?;
        self.cache.insert(model_id, text, count);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingCounter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenCounter for CountingCounter {
        async fn count_tokens(&self, text: &str, _model_id: &str) -> Result<u32, TokenCountError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(text.split_whitespace().count() as u32)
        }
    }

    #[tokio::test]
    async fn estimate_rounds_up() {
        let counter = EstimateTokenCounter;
        assert_eq!(counter.count_tokens("", "m").await.unwrap(), 0);
        assert_eq!(counter.count_tokens("abcde", "m").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn cache_memoizes_per_model() {
        let cache = Arc::new(TokenCache::new(16));
        let counter = CachedTokenCounter::new(
            CountingCounter { calls: AtomicUsize::new(0) },
            cache.clone(),
        );

        assert_eq!(counter.count_tokens("one two three", "a").await.unwrap(), 3);
        assert_eq!(counter.count_tokens("one two three", "a").await.unwrap(), 3);
        assert_eq!(counter.count_tokens("one two three", "b").await.unwrap(), 3);
        assert_eq!(counter.inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats(), (1, 2));
    }

    #[test]
    fn cache_evicts_least_recent() {
        let cache = TokenCache::new(1);
        cache.insert("m", "first", 1);
        cache.insert("m", "second", 2);
        assert_eq!(cache.get("m", "first"), None);
        assert_eq!(cache.get("m", "second"), Some(2));
    }

    #[tokio::test]
    async fn missing_tokenizer_file_is_a_load_error() {
        let result = HfTokenCounter::from_file("/nonexistent/tokenizer.json");
        assert!(matches!(result, Err(TokenCountError::Load(_))));

        let empty = HfTokenCounter::default();
        let err = empty.count_tokens("hi", "gpt").await.unwrap_err();
        assert!(matches!(err, TokenCountError::UnknownModel(_)));
    }
}
