use std::{collections::HashMap, sync::Arc};

use ivalink_core::prelude::CodecType;
use parking_lot::RwLock;

use crate::{
    RegistryError,
    engine::{DecodeEngine, DecodeEngineFactory, EncodeEngine, EncodeEngineFactory},
    params::{DecCreateParams, DecDynamicParams, EncCreateParams, EncDynamicParams},
};

#[derive(Default)]
struct RegistryInner {
    decoders: HashMap<CodecType, Arc<dyn DecodeEngineFactory>>,
    encoders: HashMap<CodecType, Arc<dyn EncodeEngineFactory>>,
}

/// Registry of engine factories keyed by codec type.
///
/// # Example
/// ```rust
/// use ivalink_codec::prelude::*;
///
/// struct Null;
/// impl DecodeEngine for Null {
///     fn control(&mut self, _: &DecControl) -> Result<(), CodecError> { Ok(()) }
///     fn process(&mut self, _: DecodeArgs<'_>) -> DecodeOutArgs { DecodeOutArgs::default() }
/// }
///
/// let registry = CodecRegistry::new();
/// registry.register_decoder(
///     CodecType::Mjpeg,
///     |_: &DecCreateParams, _: &DecDynamicParams| -> Result<Box<dyn DecodeEngine>, CodecError> {
///         Ok(Box::new(Null))
///     },
/// );
/// let handle = registry.handle();
/// assert!(handle.has_decoder(CodecType::Mjpeg));
/// assert!(!handle.has_decoder(CodecType::H264High));
/// ```
#[derive(Default)]
pub struct CodecRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a decode factory, replacing any previous one for `codec`.
    pub fn register_decoder<F>(&self, codec: CodecType, factory: F)
    where
        F: DecodeEngineFactory + 'static,
    {
        self.inner.write().decoders.insert(codec, Arc::new(factory));
    }

    /// Register an encode factory, replacing any previous one for `codec`.
    pub fn register_encoder<F>(&self, codec: CodecType, factory: F)
    where
        F: EncodeEngineFactory + 'static,
    {
        self.inner.write().encoders.insert(codec, Arc::new(factory));
    }

    /// Cheap cloneable lookup handle.
    pub fn handle(&self) -> CodecRegistryHandle {
        CodecRegistryHandle {
            inner: self.inner.clone(),
        }
    }
}

/// Thread-safe handle for engine creation.
#[derive(Clone)]
pub struct CodecRegistryHandle {
    inner: Arc<RwLock<RegistryInner>>,
}

impl CodecRegistryHandle {
    pub fn has_decoder(&self, codec: CodecType) -> bool {
        self.inner.read().decoders.contains_key(&codec)
    }

    pub fn has_encoder(&self, codec: CodecType) -> bool {
        self.inner.read().encoders.contains_key(&codec)
    }

    /// Create a decode engine for `params.codec`.
    pub fn create_decoder(
        &self,
        params: &DecCreateParams,
        dynamic: &DecDynamicParams,
    ) -> Result<Box<dyn DecodeEngine>, RegistryError> {
        let factory = self
            .inner
            .read()
            .decoders
            .get(&params.codec)
            .cloned()
            .ok_or(RegistryError::NotFound(params.codec))?;
        Ok(factory.create(params, dynamic)?)
    }

    /// Create an encode engine for `params.codec`.
    pub fn create_encoder(
        &self,
        params: &EncCreateParams,
        dynamic: &EncDynamicParams,
    ) -> Result<Box<dyn EncodeEngine>, RegistryError> {
        let factory = self
            .inner
            .read()
            .encoders
            .get(&params.codec)
            .cloned()
            .ok_or(RegistryError::NotFound(params.codec))?;
        Ok(factory.create(params, dynamic)?)
    }
}
