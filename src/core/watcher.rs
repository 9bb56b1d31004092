//! Desktop directory watcher feeding the added/removed/updated signals

use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;
use notify::{Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use tracing::{debug, info};

use super::appid::AppId;
use super::observer::{InfoEvent, ObserverBus};
use crate::packages::LegacyBackend;

pub struct DesktopWatcher {
    _watcher: PollWatcher,
    _handle: JoinHandle<()>,
}

impl DesktopWatcher {
    /// Watch every existing directory in `dirs`
    pub fn start(dirs: &[PathBuf], bus: Arc<ObserverBus>, interval: Duration) -> Result<Self> {
        let (tx, rx) = channel();
        let config = notify::Config::default().with_poll_interval(interval);

        let mut watcher = PollWatcher::new(
            move |res: notify::Result<Event>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            config,
        )?;

        for dir in dirs.iter().filter(|d| d.is_dir()) {
            watcher.watch(dir, RecursiveMode::NonRecursive)?;
            info!("Watching {} for desktop file changes", dir.display());
        }

        let handle = std::thread::Builder::new()
            .name("desktop-watcher".to_string())
            .spawn(move || {
                for event in rx {
                    handle_fs_event(&event, &bus);
                }
                debug!("Desktop watcher stopped");
            })?;

        Ok(Self {
            _watcher: watcher,
            _handle: handle,
        })
    }
}

fn desktop_app_id(path: &Path) -> Option<AppId> {
    if path.extension().and_then(|e| e.to_str()) != Some("desktop") {
        return None;
    }
    let id = LegacyBackend::app_id(path.file_stem()?.to_str()?);
    (!id.is_empty()).then_some(id)
}

fn handle_fs_event(event: &Event, bus: &ObserverBus) {
    for app_id in event.paths.iter().filter_map(|p| desktop_app_id(p)) {
        let info = InfoEvent { app_id };
        match event.kind {
            EventKind::Create(_) => bus.app_added().emit(&info),
            EventKind::Modify(_) => bus.app_info_updated().emit(&info),
            EventKind::Remove(_) => bus.app_removed().emit(&info),
            _ => {}
        }
    }
}
