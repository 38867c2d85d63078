//! Explicitly constructed codec registry.
//!
//! Replaces a process-wide codec table: whoever opens an image owns a
//! registry (usually behind an `Arc`) and passes it to the storage layer.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::CodecError;
use crate::geometry::BlockGeometry;

use super::{
    BlockCodec, CodecKind, DeflateCodec, FaxGroup4Codec, IdentityCodec, RunLengthCodec,
};

/// Builds a codec configured for one level's block geometry.
pub type CodecFactory = Arc<dyn Fn(&BlockGeometry) -> Box<dyn BlockCodec> + Send + Sync>;

/// Maps codec identifiers to factories.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    factories: HashMap<CodecKind, CodecFactory>,
}

impl CodecRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the identity, run-length, fax group 4 and deflate codecs.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(CodecKind::Identity, |g: &BlockGeometry| {
            Box::new(IdentityCodec::new(
                g.block_width(),
                g.block_height(),
                g.bits_per_pixel(),
            )) as Box<dyn BlockCodec>
        });
        registry.register(CodecKind::RunLength, |g: &BlockGeometry| {
            Box::new(RunLengthCodec::new(
                g.block_width(),
                g.block_height(),
                g.bits_per_pixel(),
            )) as Box<dyn BlockCodec>
        });
        registry.register(CodecKind::FaxGroup4, |g: &BlockGeometry| {
            let mut codec = FaxGroup4Codec::new(g.block_width(), g.block_height());
            if g.bits_per_pixel() != 1 {
                codec.set_bits_per_pixel(g.bits_per_pixel());
                codec.reset();
            }
            Box::new(codec) as Box<dyn BlockCodec>
        });
        registry.register(CodecKind::Deflate, |g: &BlockGeometry| {
            Box::new(DeflateCodec::new(
                g.block_width(),
                g.block_height(),
                g.bits_per_pixel(),
            )) as Box<dyn BlockCodec>
        });
        registry
    }

    /// Register (or replace) the factory for `kind`.
    pub fn register<F>(&mut self, kind: CodecKind, factory: F)
    where
        F: Fn(&BlockGeometry) -> Box<dyn BlockCodec> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Arc::new(factory));
    }

    pub fn contains(&self, kind: CodecKind) -> bool {
        self.factories.contains_key(&kind)
    }

    /// Create a codec for `kind` configured for `geometry`.
    pub fn create(
        &self,
        kind: CodecKind,
        geometry: &BlockGeometry,
    ) -> Result<Box<dyn BlockCodec>, CodecError> {
        let factory = self
            .factories
            .get(&kind)
            .ok_or(CodecError::UnknownCodec(kind.id()))?;
        Ok(factory(geometry))
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<u16> = self.factories.keys().map(|k| k.id()).collect();
        kinds.sort_unstable();
        f.debug_struct("CodecRegistry").field("codecs", &kinds).finish()
    }
}
