// Progress registry - per-item progress state shared with the display
//
// The registry owns every indicator. Downloads call spawn/update/fade_and_remove;
// displays (terminal bars, desktop webview) subscribe to the event stream and
// never touch the state themselves.

pub mod terminal;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};

/// Delay before an idle container is hidden, after the last indicator fades out
pub const DEFAULT_HIDE_CHECK: Duration = Duration::from_secs(5);

const EVENT_BUFFER: usize = 256;

/// State changes published to displays
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// The container went from hidden to visible
    ContainerShown,
    Spawned { id: String, label: String },
    Updated { id: String, percent: u8 },
    Failed { id: String, message: String },
    /// Indicator starts its fade-out transition, lasting `fade_ms`
    Fading { id: String, fade_ms: u64 },
    Removed { id: String },
    /// No indicators left; the whole container can go
    ContainerHidden,
}

/// One indicator as currently displayed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEntry {
    pub id: String,
    pub label: String,
    pub percent: u8,
    pub error: Option<String>,
    pub fading: bool,
}

#[derive(Default)]
struct State {
    entries: Vec<ProgressEntry>,
    visible: bool,
}

struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<ProgressEvent>,
    active: watch::Sender<usize>,
    hide_check: Duration,
}

/// Cloneable handle to the shared progress state
#[derive(Clone)]
pub struct ProgressRegistry {
    inner: Arc<Inner>,
}

impl Default for ProgressRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HIDE_CHECK)
    }
}

impl ProgressRegistry {
    pub fn new(hide_check: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (active, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                events,
                active,
                hide_check,
            }),
        }
    }

    /// Stream of state changes, starting from now
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.events.subscribe()
    }

    /// Current indicators in creation order
    pub fn snapshot(&self) -> Vec<ProgressEntry> {
        self.lock().entries.clone()
    }

    pub fn is_visible(&self) -> bool {
        self.lock().visible
    }

    /// Add a zero-percent indicator for `id` and return its key.
    ///
    /// The same item can be downloaded twice at once (duplicate playlist
    /// entries); the second indicator gets a `#2` key so updates stay apart.
    pub fn spawn(&self, id: &str, label: &str) -> String {
        let mut state = self.lock();
        let key = unique_key(&state.entries, id);
        state.entries.push(ProgressEntry {
            id: key.clone(),
            label: label.to_string(),
            percent: 0,
            error: None,
            fading: false,
        });
        if !state.visible {
            state.visible = true;
            self.emit(ProgressEvent::ContainerShown);
        }
        self.emit(ProgressEvent::Spawned {
            id: key.clone(),
            label: label.to_string(),
        });
        self.inner.active.send_replace(state.entries.len());
        key
    }

    /// Set the displayed percentage. Unknown ids are ignored.
    pub fn update(&self, id: &str, percent: u8) {
        let percent = percent.min(100);
        let mut state = self.lock();
        if let Some(entry) = state.entries.iter_mut().find(|e| e.id == id) {
            if entry.percent != percent {
                entry.percent = percent;
                self.emit(ProgressEvent::Updated {
                    id: id.to_string(),
                    percent,
                });
            }
        }
    }

    /// Mark the indicator as failed; it still has to be faded out.
    pub fn fail(&self, id: &str, message: &str) {
        let mut state = self.lock();
        if let Some(entry) = state.entries.iter_mut().find(|e| e.id == id) {
            entry.error = Some(message.to_string());
            self.emit(ProgressEvent::Failed {
                id: id.to_string(),
                message: message.to_string(),
            });
        }
    }

    /// Wait `delay`, fade for `fade`, then detach the indicator. A fixed
    /// check afterwards hides the container if nothing is left.
    ///
    /// Returns immediately; the sequence runs on the tokio runtime.
    pub fn fade_and_remove(&self, id: &str, delay: Duration, fade: Duration) {
        let registry = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            registry.start_fade(&id, fade);
            tokio::time::sleep(fade).await;
            registry.remove(&id);
            tokio::time::sleep(registry.inner.hide_check).await;
            registry.hide_if_empty();
        });
    }

    /// Resolve once every indicator has been removed
    pub async fn wait_until_empty(&self) {
        let mut rx = self.inner.active.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    fn start_fade(&self, id: &str, fade: Duration) {
        let mut state = self.lock();
        if let Some(entry) = state.entries.iter_mut().find(|e| e.id == id) {
            entry.fading = true;
            self.emit(ProgressEvent::Fading {
                id: id.to_string(),
                fade_ms: fade.as_millis() as u64,
            });
        }
    }

    fn remove(&self, id: &str) {
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|e| e.id != id);
        if state.entries.len() != before {
            self.emit(ProgressEvent::Removed { id: id.to_string() });
            self.inner.active.send_replace(state.entries.len());
        }
    }

    fn hide_if_empty(&self) {
        let mut state = self.lock();
        if state.entries.is_empty() && state.visible {
            state.visible = false;
            self.emit(ProgressEvent::ContainerHidden);
        }
    }

    fn emit(&self, event: ProgressEvent) {
        // No subscribers is fine (tests, headless runs)
        let _ = self.inner.events.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn unique_key(entries: &[ProgressEntry], id: &str) -> String {
    if !entries.iter().any(|e| e.id == id) {
        return id.to_string();
    }
    let mut n = 2;
    loop {
        let key = format!("{}#{}", id, n);
        if !entries.iter().any(|e| e.id == key) {
            return key;
        }
        n += 1;
    }
}
