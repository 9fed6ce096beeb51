use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{error, info, warn};

use crate::config;
use crate::engine::Engine;
use crate::matcher::RuntimeConfig;

const RELOAD_RETRIES: u32 = 3;

pub fn spawn(path: PathBuf, engine: Engine) {
    // 使用阻塞线程持有watcher，避免异步生命周期问题。
    thread::spawn(move || {
        if let Err(err) = run_watcher(path, engine) {
            error!(target = "watcher", error = %err, "config watcher exited with error");
        }
    });
}

fn run_watcher(path: PathBuf, engine: Engine) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Config::default())?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    info!(target = "watcher", path = %path.display(), "config watcher started");

    for res in rx {
        match res {
            Ok(_event) => {
                reload_with_retries(&path, &engine);
            }
            Err(err) => {
                warn!(target = "watcher", error = %err, "watcher event error");
            }
        }
    }
    Ok(())
}

/// Load, compile and apply `path`. Returns the number of cache entries dropped,
/// or `None` when the file never parsed and the old config stays in place.
pub fn reload_with_retries(path: &Path, engine: &Engine) -> Option<usize> {
    // 写文件时可能先截断再写入，短暂重试
    let mut retries = RELOAD_RETRIES;
    loop {
        match config::load_config(path).and_then(RuntimeConfig::from_config) {
            Ok(next) => {
                let removed = engine.reload(next);
                info!(target = "watcher", path = %path.display(), invalidated = removed, "config reloaded");
                return Some(removed);
            }
            Err(err) => {
                retries -= 1;
                if retries == 0 {
                    warn!(target = "watcher", path = %path.display(), error = %err, "config reload failed, keeping old config");
                    return None;
                }
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}
