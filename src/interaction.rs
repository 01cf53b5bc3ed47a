//! Interaction lifecycle — runs a `TickHandler` on its own thread.
//!
//! `Interaction::stop` raises the stop signal, runs the handler's teardown
//! hooks (which wake any blocking wait) and joins the thread, so nothing is
//! played after it returns.

use crate::config::ConfigError;
use crate::generator::GeneratorError;
use log::{error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

#[derive(Debug, thiserror::Error)]
pub enum InteractionError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("generator error: {0}")]
    Generator(#[from] GeneratorError),

    #[error("failed to spawn interaction thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("interaction thread panicked")]
    Panicked,
}

type StopHook = Box<dyn FnOnce() + Send>;

struct StopInner {
    raised: AtomicBool,
    hooks: Mutex<Vec<StopHook>>,
}

/// Cooperative cancellation shared between the caller and the loop thread.
#[derive(Clone)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StopInner {
                raised: AtomicBool::new(false),
                hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_set(&self) -> bool {
        self.inner.raised.load(Ordering::Acquire)
    }

    /// Raise the signal and run every registered hook once.
    pub fn raise(&self) {
        self.inner.raised.store(true, Ordering::Release);
        let hooks: Vec<StopHook> = match self.inner.hooks.lock() {
            Ok(mut hooks) => hooks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for hook in hooks {
            hook();
        }
    }

    /// Run `hook` when the signal is raised (immediately if it already was).
    pub fn on_stop(&self, hook: impl FnOnce() + Send + 'static) {
        if let Ok(mut hooks) = self.inner.hooks.lock() {
            if !self.is_set() {
                hooks.push(Box::new(hook));
                return;
            }
        }
        hook();
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// One style of interaction. Call-and-response is one implementor; others
/// plug in the same way.
pub trait TickHandler: Send + 'static {
    fn name(&self) -> &str;

    /// The main loop. Must return within one tick after `stop` is raised.
    fn run(&mut self, stop: &StopSignal) -> Result<(), InteractionError>;
}

/// A running interaction.
pub struct Interaction {
    name: String,
    stop: StopSignal,
    handle: Option<JoinHandle<Result<(), InteractionError>>>,
}

impl Interaction {
    /// Launch `handler` on a dedicated thread.
    pub fn start<H: TickHandler>(mut handler: H) -> Result<Self, InteractionError> {
        let name = handler.name().to_string();
        let stop = StopSignal::new();
        let thread_stop = stop.clone();
        let handle = thread::Builder::new()
            .name("interaction".into())
            .spawn(move || handler.run(&thread_stop))
            .map_err(InteractionError::Spawn)?;
        info!("Interaction '{}' started", name);
        Ok(Self {
            name,
            stop,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once the loop thread has exited (or was already joined).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Stop the loop and block until it has exited. Returns the loop's own
    /// result; a second call returns Ok.
    pub fn stop(&mut self) -> Result<(), InteractionError> {
        if self.handle.is_none() {
            return Ok(());
        }
        info!("Stopping interaction '{}'", self.name);
        self.stop.raise();
        self.join()
    }

    /// Block until the loop exits on its own.
    pub fn wait(&mut self) -> Result<(), InteractionError> {
        self.join()
    }

    fn join(&mut self) -> Result<(), InteractionError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let result = handle.join().map_err(|_| InteractionError::Panicked)?;
        if let Err(e) = &result {
            error!("Interaction '{}' ended with error: {}", self.name, e);
        } else {
            info!("Interaction '{}' stopped", self.name);
        }
        result
    }
}

impl Drop for Interaction {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
