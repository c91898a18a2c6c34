//! Name to factory map for frame decoders.

use super::{FrameDecoder, PercivalDecoder};
use crate::error::{DecoderError, DecoderResult};
use std::collections::BTreeMap;

/// Builds a decoder with its default layout.
pub type DecoderFactory = fn() -> Box<dyn FrameDecoder>;

/// Explicit registry of decoder types.
#[derive(Debug, Clone, Default)]
pub struct DecoderRegistry {
    factories: BTreeMap<String, DecoderFactory>,
}

impl DecoderRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every decoder shipped in this crate.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(PercivalDecoder::NAME, || Box::new(PercivalDecoder::default()));
        registry
    }

    /// Register `factory` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: &str, factory: DecoderFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Build the decoder registered as `name`.
    pub fn create(&self, name: &str) -> DecoderResult<Box<dyn FrameDecoder>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| DecoderError::UnknownDecoder(name.to_string()))
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}
