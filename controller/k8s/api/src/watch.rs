use futures::prelude::*;
pub use kube::runtime::watcher::{Event, Result};
use kube::{runtime::watcher, Api, Client, Resource};
use serde::de::DeserializeOwned;
use std::{fmt, pin::Pin};
use tracing::{info, Instrument};
use wafie_controller_core::backoff::{Backoff, Retry};

type EventStream<T> = Pin<Box<dyn Stream<Item = Result<Event<T>>> + Send + 'static>>;

/// Wraps an event stream that never terminates.
///
/// Errors are logged and retried according to the backoff policy. If the
/// underlying stream ends, a new one is started.
pub struct Watch<T> {
    initialized: bool,
    span: tracing::Span,
    backoff: Retry,
    connect: Box<dyn Fn() -> EventStream<T> + Send + Sync + 'static>,
    rx: EventStream<T>,
}

// === impl Watch ===

impl<T> Watch<T> {
    pub fn new<F, S>(connect: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Event<T>>> + Send + 'static,
    {
        let connect = Box::new(move || -> EventStream<T> { connect().boxed() });
        let rx = connect();
        Self {
            initialized: false,
            span: tracing::Span::current(),
            backoff: Backoff::default().retry(),
            connect,
            rx,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff.retry();
        self
    }

    pub fn instrument(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Receive the next event in the stream.
    pub async fn recv(&mut self) -> Event<T> {
        loop {
            let ev = self.rx.next().instrument(self.span.clone()).await;
            match ev {
                Some(Ok(ev)) => {
                    self.initialized = true;
                    self.backoff.reset();
                    return ev;
                }
                Some(Err(error)) => {
                    info!(parent: &self.span, %error, attempt = self.backoff.attempts(), "Failed");
                    self.backoff.wait().await;
                    info!(parent: &self.span, "Restarting");
                }
                None => {
                    info!(parent: &self.span, "Stream ended");
                    self.backoff.wait().await;
                    self.rx = (self.connect)();
                    info!(parent: &self.span, "Restarted");
                }
            }
        }
    }
}

impl<T> Watch<T>
where
    T: Resource + Clone + DeserializeOwned + fmt::Debug + Send + 'static,
    T::DynamicType: Default,
{
    /// Watches all resources of type `T` across namespaces.
    pub fn all(client: Client, config: watcher::Config) -> Self {
        Self::new(move || watcher(Api::<T>::all(client.clone()), config.clone()))
    }
}

impl<T> fmt::Debug for Watch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watch")
            .field("initialized", &self.initialized)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}
