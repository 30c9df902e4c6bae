use crate::error::{IdempotencyError, Result};
use crate::events::consumer::{ConsumedMessage, MessageHandler};
use crate::idempotency::guard::{Admission, IdempotencyGuard, ListenerOptions};
use crate::idempotency::identity::IdentityExtractor;
use async_trait::async_trait;

/// A message handler wrapped with the idempotency guard.
///
/// Runs the admission check, invokes the inner handler only when admitted and
/// records the marker once the inner handler succeeded. A skipped message is
/// acknowledged as handled.
pub struct IdempotentListener<H> {
    inner: H,
    guard: IdempotencyGuard,
    extractor: IdentityExtractor<ConsumedMessage>,
    options: ListenerOptions,
}

impl<H: MessageHandler> IdempotentListener<H> {
    pub fn new(
        inner: H,
        guard: IdempotencyGuard,
        extractor: IdentityExtractor<ConsumedMessage>,
        options: ListenerOptions,
    ) -> Self {
        Self {
            inner,
            guard,
            extractor,
            options,
        }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }

    pub fn guard(&self) -> &IdempotencyGuard {
        &self.guard
    }

    pub fn options(&self) -> &ListenerOptions {
        &self.options
    }
}

#[async_trait]
impl<H: MessageHandler> MessageHandler for IdempotentListener<H> {
    async fn handle(&self, message: &ConsumedMessage) -> Result<()> {
        if !self.guard.is_enabled() {
            return self.inner.handle(message).await;
        }

        let identity = || self.extractor.extract(message);
        if self.guard.check(&self.options.name, identity).await? == Admission::Skip {
            return Ok(());
        }

        self.inner.handle(message).await?;
        self.guard
            .persist(&self.options.name, self.options.ttl_seconds, identity)
            .await;
        Ok(())
    }

    async fn on_dead_letter(&self, message: &ConsumedMessage, error: &IdempotencyError) {
        self.inner.on_dead_letter(message, error).await
    }
}

/// Wraps `handler` so each message passes through `guard` first.
pub fn idempotent<H: MessageHandler>(
    handler: H,
    guard: IdempotencyGuard,
    extractor: IdentityExtractor<ConsumedMessage>,
    options: ListenerOptions,
) -> IdempotentListener<H> {
    IdempotentListener::new(handler, guard, extractor, options)
}

impl IdempotencyGuard {
    /// Decorates `handler` with this guard.
    pub fn wrap<H: MessageHandler>(
        &self,
        handler: H,
        extractor: IdentityExtractor<ConsumedMessage>,
        options: ListenerOptions,
    ) -> IdempotentListener<H> {
        IdempotentListener::new(handler, self.clone(), extractor, options)
    }
}
