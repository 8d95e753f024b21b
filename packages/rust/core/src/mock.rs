//! Scripted in-process generation service for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use studydeck_shared::{Result, StudyDeckError};

use crate::service::{
    Availability, Capability, GenerationService, GenerationSession, SessionSpec,
};

type Responder = dyn Fn(&SessionSpec, &str) -> Result<String> + Send + Sync;

struct MockInner {
    responder: Box<Responder>,
    block_runs: bool,
    opened: AtomicUsize,
    destroyed: AtomicUsize,
    calls: Mutex<Vec<(SessionSpec, String)>>,
}

pub(crate) struct MockService {
    inner: Arc<MockInner>,
    availability: HashMap<Capability, Availability>,
    probe_fails: bool,
}

impl MockService {
    pub(crate) fn new(
        responder: impl Fn(&SessionSpec, &str) -> Result<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(MockInner {
                responder: Box::new(responder),
                block_runs: false,
                opened: AtomicUsize::new(0),
                destroyed: AtomicUsize::new(0),
                calls: Mutex::new(Vec::new()),
            }),
            availability: HashMap::new(),
            probe_fails: false,
        }
    }

    pub(crate) fn with_availability(mut self, capability: Capability, status: Availability) -> Self {
        self.availability.insert(capability, status);
        self
    }

    pub(crate) fn with_failing_probe(mut self) -> Self {
        self.probe_fails = true;
        self
    }

    /// Runs wait until their token is cancelled.
    pub(crate) fn blocking(self) -> Self {
        let inner = Arc::try_unwrap(self.inner)
            .ok()
            .expect("blocking() must be called before sessions are opened");
        Self {
            inner: Arc::new(MockInner {
                block_runs: true,
                ..inner
            }),
            ..self
        }
    }

    pub(crate) fn opened(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    pub(crate) fn destroyed(&self) -> usize {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Every `run` so far, as (session spec, input).
    pub(crate) fn calls(&self) -> Vec<(SessionSpec, String)> {
        self.inner.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationService for MockService {
    async fn availability(&self, capability: Capability) -> Result<Availability> {
        if self.probe_fails {
            return Err(StudyDeckError::Generation("probe crashed".into()));
        }
        Ok(self
            .availability
            .get(&capability)
            .copied()
            .unwrap_or(Availability::Ready))
    }

    async fn open_session(&self, spec: SessionSpec) -> Result<Arc<dyn GenerationSession>> {
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockSession {
            inner: self.inner.clone(),
            spec,
            destroyed: Mutex::new(false),
        }))
    }
}

struct MockSession {
    inner: Arc<MockInner>,
    spec: SessionSpec,
    destroyed: Mutex<bool>,
}

#[async_trait]
impl GenerationSession for MockSession {
    async fn run(&self, input: &str, cancel: &CancellationToken) -> Result<String> {
        self.inner
            .calls
            .lock()
            .unwrap()
            .push((self.spec.clone(), input.to_string()));
        if self.inner.block_runs {
            cancel.cancelled().await;
            return Err(StudyDeckError::Cancelled);
        }
        (self.inner.responder)(&self.spec, input)
    }

    async fn run_streaming(
        &self,
        input: &str,
        cancel: &CancellationToken,
        snapshots: &watch::Sender<String>,
    ) -> Result<String> {
        let text = self.run(input, cancel).await?;
        let half: String = text.chars().take(text.chars().count() / 2).collect();
        snapshots.send_replace(half);
        tokio::task::yield_now().await;
        snapshots.send_replace(text.clone());
        Ok(text)
    }

    fn destroy(&self) {
        let mut destroyed = self.destroyed.lock().unwrap();
        if !*destroyed {
            *destroyed = true;
            self.inner.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }
}
