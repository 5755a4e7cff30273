//! Folder-backed image source.
//!
//! Watches a directory for image files. A `notify` watcher updates the
//! latest-candidate slot on create/modify events; the polling side reads the
//! slot, applies the delivery gates and decodes the file. A stale slot read
//! only defers delivery to the next poll.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use super::{is_image_file, ImageSource, SourceMetadata};
use crate::frame::{decode_image, Frame};

const SOURCE_KIND: &str = "folder";

/// Configuration for a folder source.
#[derive(Clone, Debug)]
pub struct FolderConfig {
    /// Logical source name.
    pub name: String,
    /// Directory to watch. Created if missing.
    pub path: PathBuf,
    /// Minimum interval between two delivered frames.
    pub update_interval: Duration,
    pub enabled: bool,
}

impl Default for FolderConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            path: PathBuf::new(),
            update_interval: Duration::from_secs(30),
            enabled: true,
        }
    }
}

/// Most recently observed candidate file, shared between the watch callback
/// and the polling side.
#[derive(Clone, Debug)]
struct Candidate {
    path: PathBuf,
    modified: SystemTime,
}

/// Source that monitors a folder for new images.
pub struct FolderSource {
    config: FolderConfig,
    latest: Arc<Mutex<Option<Candidate>>>,
    watcher: Option<RecommendedWatcher>,
    last_delivered_mtime: Option<SystemTime>,
    last_delivered_at: Option<Instant>,
    last_delivered_wall: Option<SystemTime>,
}

impl FolderSource {
    pub fn new(config: FolderConfig) -> Self {
        Self {
            config,
            latest: Arc::new(Mutex::new(None)),
            watcher: None,
            last_delivered_mtime: None,
            last_delivered_at: None,
            last_delivered_wall: None,
        }
    }

    /// Seed the latest-candidate slot from the directory contents.
    fn scan_latest(&self) -> Result<()> {
        let entries = std::fs::read_dir(&self.config.path)
            .with_context(|| format!("scan image folder {}", self.config.path.display()))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || !is_image_file(&path) {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(modified) = meta.modified() else { continue };
            update_candidate(&self.latest, path, modified);
        }
        Ok(())
    }

    fn current_candidate(&self) -> Option<Candidate> {
        self.latest.lock().ok().and_then(|slot| slot.clone())
    }
}

impl ImageSource for FolderSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> &'static str {
        SOURCE_KIND
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn start(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.config.path)
            .with_context(|| format!("create image folder {}", self.config.path.display()))?;
        self.scan_latest()?;

        let latest = Arc::clone(&self.latest);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        return;
                    }
                    for path in event.paths {
                        if !is_image_file(&path) {
                            continue;
                        }
                        let Ok(meta) = std::fs::metadata(&path) else { continue };
                        let Ok(modified) = meta.modified() else { continue };
                        log::debug!("image event: {}", path.display());
                        update_candidate(&latest, path, modified);
                    }
                }
                Err(e) => log::warn!("image folder watch error: {}", e),
            },
            notify::Config::default(),
        )
        .context("create folder watcher")?;
        watcher
            .watch(&self.config.path, RecursiveMode::NonRecursive)
            .with_context(|| format!("watch {}", self.config.path.display()))?;
        self.watcher = Some(watcher);

        log::info!(
            "source {}: watching {}",
            self.config.name,
            self.config.path.display()
        );
        Ok(())
    }

    fn stop(&mut self) {
        if self.watcher.take().is_some() {
            log::info!(
                "source {}: stopped watching {}",
                self.config.name,
                self.config.path.display()
            );
        }
    }

    fn is_available(&self) -> bool {
        self.config.path.is_dir()
    }

    fn latest_frame(&mut self) -> Option<Frame> {
        let candidate = self.current_candidate()?;

        if let Some(at) = self.last_delivered_at {
            if at.elapsed() < self.config.update_interval {
                return None;
            }
        }
        if let Some(delivered) = self.last_delivered_mtime {
            if candidate.modified <= delivered {
                return None;
            }
        }

        match decode_image(&candidate.path) {
            Ok(frame) => {
                self.last_delivered_mtime = Some(candidate.modified);
                self.last_delivered_at = Some(Instant::now());
                self.last_delivered_wall = Some(SystemTime::now());
                log::debug!(
                    "source {}: delivering {} ({}x{})",
                    self.config.name,
                    candidate.path.display(),
                    frame.width(),
                    frame.height()
                );
                Some(frame)
            }
            Err(e) => {
                log::error!(
                    "source {}: failed to decode {}: {:#}",
                    self.config.name,
                    candidate.path.display(),
                    e
                );
                None
            }
        }
    }

    fn metadata(&self) -> SourceMetadata {
        let candidate = self.current_candidate();
        let file_size = candidate
            .as_ref()
            .and_then(|c| std::fs::metadata(&c.path).ok())
            .map(|m| m.len());
        SourceMetadata {
            name: self.config.name.clone(),
            kind: SOURCE_KIND,
            file_path: candidate.as_ref().map(|c| c.path.clone()),
            file_size,
            modified_at: candidate.as_ref().map(|c| c.modified),
            last_delivered_at: self.last_delivered_wall,
        }
    }
}

/// Replace the tracked candidate when the new file is strictly newer.
/// Modification-time ties keep the previously tracked file.
fn update_candidate(slot: &Mutex<Option<Candidate>>, path: PathBuf, modified: SystemTime) {
    let Ok(mut latest) = slot.lock() else { return };
    let newer = latest
        .as_ref()
        .map_or(true, |current| modified > current.modified);
    if newer {
        *latest = Some(Candidate { path, modified });
    }
}
