//! Lifecycle events from cgroup filesystem notifications
//!
//! A container cgroup is created before the runtime moves its first process
//! into it, so a new cgroup stays pending until cgroup.procs lists a pid and
//! only then becomes a creation. Removing the cgroup is a deletion.
//! OOM events come from the `oom` and `oom_kill` counters of memory.events,
//! which the kernel touches whenever they move.

use super::cgroup::{first_pid, CgroupDriver};
use super::{DriverResult, EventStream};
use crate::models::{ContainerEvent, EventType};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const MEMORY_EVENTS: &str = "memory.events";
const CGROUP_PROCS: &str = "cgroup.procs";
const CGROUP_EVENTS: &str = "cgroup.events";

/// Watches a cgroup hierarchy for container lifecycle events
pub(super) struct CgroupWatcher {
    cgroup_root: PathBuf,
    types: Vec<EventType>,
}

impl CgroupWatcher {
    pub fn new(cgroup_root: impl Into<PathBuf>, types: &[EventType]) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
            types: types.to_vec(),
        }
    }

    /// Start watching; the returned stream stops the watch when dropped
    pub fn start(self, capacity: usize) -> DriverResult<EventStream> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = raw_tx.send(event);
                }
                Err(e) => warn!(error = %e, "Filesystem watch error"),
            },
            notify::Config::default(),
        )?;
        watcher.watch(&self.cgroup_root, RecursiveMode::Recursive)?;
        info!(path = %self.cgroup_root.display(), "Watching cgroup hierarchy");

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let types = self.types;

        tokio::spawn(async move {
            let mut state = WatchState::default();

            while let Some(event) = raw_rx.recv().await {
                for container_event in translate(&event, &mut state).await {
                    if !types.contains(&container_event.event_type) {
                        continue;
                    }
                    debug!(
                        container.name = %container_event.container_name,
                        event = %container_event.event_type,
                        "Container event"
                    );
                    if tx.send(container_event).await.is_err() {
                        debug!("Event stream dropped, stopping watcher task");
                        return;
                    }
                }
            }
        });

        Ok(EventStream::with_guard(rx, watcher))
    }
}

/// Last seen `oom` and `oom_kill` counters per container
#[derive(Default)]
struct OomCounters {
    seen: HashMap<String, (u64, u64)>,
}

impl OomCounters {
    /// Record new counter values, returning the events their growth implies
    fn update(&mut self, name: &str, oom: u64, oom_kill: u64) -> Vec<EventType> {
        let (last_oom, last_kill) = self
            .seen
            .insert(name.to_string(), (oom, oom_kill))
            .unwrap_or((0, 0));

        let mut events = Vec::new();
        if oom > last_oom {
            events.push(EventType::Oom);
        }
        if oom_kill > last_kill {
            events.push(EventType::OomKill);
        }
        events
    }

    fn forget(&mut self, name: &str) {
        self.seen.remove(name);
    }
}

/// Per-watch bookkeeping of the translation task
#[derive(Default)]
struct WatchState {
    oom: OomCounters,
    /// Containers whose cgroup exists but holds no process yet
    pending: HashSet<String>,
}

impl WatchState {
    fn forget(&mut self, name: &str) {
        self.oom.forget(name);
        self.pending.remove(name);
    }
}

/// Container id of a cgroup directory
fn container_of(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|name| CgroupDriver::extract_container_id(&name.to_string_lossy()))
}

async fn has_processes(dir: &Path) -> bool {
    first_pid(dir).await.is_some()
}

async fn translate(event: &Event, state: &mut WatchState) -> Vec<ContainerEvent> {
    let mut events = Vec::new();

    for path in &event.paths {
        match event.kind {
            EventKind::Create(_) => {
                let Some(name) = container_of(path) else {
                    continue;
                };
                if has_processes(path).await {
                    events.push(ContainerEvent::new(EventType::Creation, name));
                } else {
                    debug!(container.name = %name, "cgroup has no process yet");
                    state.pending.insert(name);
                }
            }
            EventKind::Remove(_) => {
                if let Some(name) = container_of(path) {
                    state.forget(&name);
                    events.push(ContainerEvent::new(EventType::Deletion, name));
                }
            }
            EventKind::Modify(_) => {
                let (Some(file), Some(dir)) = (path.file_name(), path.parent()) else {
                    continue;
                };
                let Some(name) = container_of(dir) else {
                    continue;
                };

                if file == MEMORY_EVENTS {
                    let Ok(content) = tokio::fs::read_to_string(path).await else {
                        continue;
                    };
                    let counters = CgroupDriver::parse_flat_keyed(&content);
                    let oom = counters.get("oom").copied().unwrap_or(0);
                    let oom_kill = counters.get("oom_kill").copied().unwrap_or(0);

                    for event_type in state.oom.update(&name, oom, oom_kill) {
                        events.push(ContainerEvent::new(event_type, name.clone()));
                    }
                } else if (file == CGROUP_PROCS || file == CGROUP_EVENTS)
                    && state.pending.contains(&name)
                    && has_processes(dir).await
                {
                    state.pending.remove(&name);
                    events.push(ContainerEvent::new(EventType::Creation, name));
                }
            }
            _ => {}
        }
    }

    events
}
