use crate::cache::ReadyCache;
use crate::config::CoordinatorConfig;
use crate::generator::ArtifactGenerator;
use crate::key::{GenerationKey, PromptDescriptor};
use chrono::{DateTime, Utc};
use genrelay_core::{ArtifactRef, GenerationError};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

type EpisodeResult = Result<ArtifactRef, GenerationError>;

/// Lifecycle state of a [`GenerationRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Pending,
    Ready,
    Failed,
}

/// Snapshot of what the coordinator knows about one key.
#[derive(Debug, Clone)]
pub struct GenerationRecord {
    pub key: GenerationKey,
    pub state: GenerationState,
    pub value: Option<ArtifactRef>,
    pub error: Option<GenerationError>,
    pub created_at: DateTime<Utc>,
}

/// Published to every subscriber once per completed episode.
#[derive(Debug, Clone)]
pub enum GenerationEvent {
    Ready {
        key: GenerationKey,
        artifact_ref: ArtifactRef,
    },
    Failed {
        key: GenerationKey,
        error: GenerationError,
    },
}

impl GenerationEvent {
    pub fn key(&self) -> &GenerationKey {
        match self {
            Self::Ready { key, .. } | Self::Failed { key, .. } => key,
        }
    }
}

/// How a request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    /// Served from the Ready cache without suspending.
    Cached,
    /// Attached to an episode another caller started.
    Joined,
    /// This caller started the episode.
    Started,
}

/// A successful request and where its value came from.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub artifact_ref: ArtifactRef,
    pub source: ResolutionSource,
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub cached: usize,
    pub capacity: usize,
    pub pending: usize,
    pub external_calls: u64,
    pub evictions: u64,
}

struct PendingEpisode {
    episode: u64,
    waiters: Vec<oneshot::Sender<EpisodeResult>>,
    created_at: DateTime<Utc>,
}

struct CoordinatorState {
    pending: HashMap<GenerationKey, PendingEpisode>,
    ready: ReadyCache,
    next_episode: u64,
}

struct Inner {
    state: Mutex<CoordinatorState>,
    generator: Arc<dyn ArtifactGenerator>,
    events: broadcast::Sender<GenerationEvent>,
    timeout: Duration,
    external_calls: AtomicU64,
}

/// Single-flight keyed cache and broker for artifact generation.
///
/// Cheap to clone; every clone shares the same pending map, cache and
/// subscriber channel. Construct one at startup and hand clones to every
/// consumer.
///
/// The pending map and the cache sit behind one mutex that is only held for
/// the lookup/insert steps; the generator call itself runs in a spawned task
/// outside the lock, so slow keys never block unrelated ones. Because the
/// episode runs in its own task, a caller that stops waiting (for example a
/// cancelled stream) does not cancel the generation: it still completes,
/// fills the cache and notifies the remaining waiters and subscribers.
#[derive(Clone)]
pub struct GenerationCoordinator {
    inner: Arc<Inner>,
}

impl GenerationCoordinator {
    pub fn new(generator: Arc<dyn ArtifactGenerator>, config: &CoordinatorConfig) -> Self {
        let (events, _) = broadcast::channel(config.subscriber_buffer.max(1));
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(CoordinatorState {
                    pending: HashMap::new(),
                    ready: ReadyCache::new(config.cache_capacity),
                    next_episode: 0,
                }),
                generator,
                events,
                timeout: config.generation_timeout(),
                external_calls: AtomicU64::new(0),
            }),
        }
    }

    /// Resolve `descriptor` to an artifact, generating it at most once.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn request(&self, descriptor: PromptDescriptor) -> EpisodeResult {
        self.resolve(descriptor).await.map(|r| r.artifact_ref)
    }

    /// Like [`request`](Self::request) but also reports how the value was obtained.
    pub async fn resolve(&self, descriptor: PromptDescriptor) -> Result<Resolution, GenerationError> {
        let key = descriptor.key();
        if key.is_empty() {
            return Err(GenerationError::Failed("prompt is empty".to_string()));
        }

        let (rx, source, episode) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;

            if let Some(artifact_ref) = state.ready.get(&key) {
                debug!(key = %key, "Generation cache hit");
                return Ok(Resolution {
                    artifact_ref,
                    source: ResolutionSource::Cached,
                });
            }

            let (tx, rx) = oneshot::channel();
            match state.pending.entry(key.clone()) {
                Entry::Occupied(mut pending) => {
                    pending.get_mut().waiters.push(tx);
                    let episode = pending.get().episode;
                    debug!(
                        key = %key,
                        episode,
                        waiters = pending.get().waiters.len(),
                        "Joined pending generation"
                    );
                    (rx, ResolutionSource::Joined, episode)
                }
                Entry::Vacant(slot) => {
                    let episode = state.next_episode;
                    state.next_episode += 1;
                    slot.insert(PendingEpisode {
                        episode,
                        waiters: vec![tx],
                        created_at: Utc::now(),
                    });
                    (rx, ResolutionSource::Started, episode)
                }
            }
        };

        if source == ResolutionSource::Started {
            self.spawn_episode(key.clone(), episode);
        }

        match rx.await {
            Ok(result) => result.map(|artifact_ref| Resolution {
                artifact_ref,
                source,
            }),
            Err(_) => Err(GenerationError::Abandoned),
        }
    }

    /// Subscribe to every completed episode. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<GenerationEvent> {
        self.inner.events.subscribe()
    }

    /// The Ready value for `key`, without triggering generation.
    pub fn peek(&self, key: &GenerationKey) -> Option<ArtifactRef> {
        self.inner.state.lock().ready.get(key)
    }

    /// The current record for `key`: Pending, Ready, or absent.
    ///
    /// Failed records are discarded as soon as their episode completes, so
    /// they are only ever observed through [`GenerationEvent::Failed`].
    pub fn record(&self, key: &GenerationKey) -> Option<GenerationRecord> {
        let state = self.inner.state.lock();
        if let Some(pending) = state.pending.get(key) {
            return Some(GenerationRecord {
                key: key.clone(),
                state: GenerationState::Pending,
                value: None,
                error: None,
                created_at: pending.created_at,
            });
        }
        let value = state.ready.get(key)?;
        Some(GenerationRecord {
            key: key.clone(),
            state: GenerationState::Ready,
            value: Some(value),
            error: None,
            created_at: state.ready.created_at(key).unwrap_or_else(Utc::now),
        })
    }

    /// Number of callers currently waiting on the pending episode for `key`.
    pub fn pending_waiters(&self, key: &GenerationKey) -> usize {
        self.inner
            .state
            .lock()
            .pending
            .get(key)
            .map_or(0, |p| p.waiters.len())
    }

    /// Drop a Ready value so the next request regenerates it.
    pub fn invalidate(&self, key: &GenerationKey) -> bool {
        let removed = self.inner.state.lock().ready.remove(key).is_some();
        if removed {
            info!(key = %key, "Invalidated cached generation");
        }
        removed
    }

    pub fn cached_len(&self) -> usize {
        self.inner.state.lock().ready.len()
    }

    pub fn stats(&self) -> CoordinatorStats {
        let state = self.inner.state.lock();
        CoordinatorStats {
            cached: state.ready.len(),
            capacity: state.ready.capacity(),
            pending: state.pending.len(),
            external_calls: self.inner.external_calls.load(Ordering::SeqCst),
            evictions: state.ready.evictions(),
        }
    }

    fn spawn_episode(&self, key: GenerationKey, episode: u64) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut guard = EpisodeGuard {
                coordinator: coordinator.clone(),
                key: key.clone(),
                episode,
                armed: true,
            };

            coordinator.inner.external_calls.fetch_add(1, Ordering::SeqCst);
            info!(key = %key, episode, "Starting generation");

            let descriptor = key.descriptor();
            let timeout = coordinator.inner.timeout;
            let outcome = match tokio::time::timeout(
                timeout,
                coordinator.inner.generator.generate(&descriptor),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(GenerationError::Timeout(timeout)),
            };

            guard.armed = false;
            coordinator.complete(&key, episode, outcome);
        });
    }

    fn complete(&self, key: &GenerationKey, episode: u64, outcome: EpisodeResult) {
        let waiters = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;

            let pending = match state.pending.remove(key) {
                Some(pending) if pending.episode == episode => pending,
                Some(other) => {
                    // Not ours: put it back untouched.
                    state.pending.insert(key.clone(), other);
                    warn!(key = %key, episode, "Completion for a superseded episode ignored");
                    return;
                }
                None => return,
            };

            if let Ok(value) = &outcome {
                for evicted in state.ready.insert(key.clone(), value.clone()) {
                    debug!(key = %evicted, "Evicted cached generation");
                }
            }
            pending.waiters
        };

        match &outcome {
            Ok(value) => info!(
                key = %key,
                episode,
                waiters = waiters.len(),
                artifact = %value,
                "Generation ready"
            ),
            Err(e) => warn!(
                key = %key,
                episode,
                waiters = waiters.len(),
                error = %e,
                "Generation failed, not cached"
            ),
        }

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }

        let event = match outcome {
            Ok(artifact_ref) => GenerationEvent::Ready {
                key: key.clone(),
                artifact_ref,
            },
            Err(error) => GenerationEvent::Failed {
                key: key.clone(),
                error,
            },
        };
        // No receivers is fine.
        let _ = self.inner.events.send(event);
    }
}

/// Fails the episode if its task ends before reporting an outcome.
struct EpisodeGuard {
    coordinator: GenerationCoordinator,
    key: GenerationKey,
    episode: u64,
    armed: bool,
}

impl Drop for EpisodeGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!(key = %self.key, episode = self.episode, "Generation episode abandoned");
            self.coordinator
                .complete(&self.key, self.episode, Err(GenerationError::Abandoned));
        }
    }
}
