// npc/src/logger.rs
//
// Single responsibility: setting up the process-wide logger

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use env_logger::{Builder, Target};
use log::Level;
use npc_core::config::{LogSettings, LogSink};

fn level_tag(level: Level) -> char {
    match level {
        Level::Error => 'E',
        Level::Warn => 'W',
        Level::Info => 'I',
        Level::Debug => 'D',
        Level::Trace => 'T',
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Per-user log location for hosts where the system path is not writable.
fn fallback_log_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("npc").join("npc.log"))
}

/// Initializes the logger for the entire application.
/// Returns the file actually written to, if any.
pub fn init_logger(settings: &LogSettings) -> Option<PathBuf> {
    let mut builder = Builder::new();
    builder
        .filter_level(settings.level_filter())
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] [{}] {}",
                Local::now().format("%Y/%m/%d %H:%M:%S%.3f"),
                level_tag(record.level()),
                record.target(),
                record.args()
            )
        });

    let mut written_to = None;
    match settings.sink {
        LogSink::Console => {
            builder.target(Target::Stdout);
        }
        LogSink::File => {
            let opened = open_append(&settings.path)
                .map(|file| (file, settings.path.clone()))
                .or_else(|err| {
                    eprintln!("cannot open log file {}: {}", settings.path.display(), err);
                    let fallback = fallback_log_path().ok_or(err)?;
                    open_append(&fallback).map(|file| (file, fallback))
                });
            match opened {
                Ok((file, path)) => {
                    builder.target(Target::Pipe(Box::new(file)));
                    written_to = Some(path);
                }
                Err(_) => {
                    builder.target(Target::Stderr);
                }
            }
        }
    }

    // A second initialization (tests) keeps the first logger.
    let _ = builder.try_init();
    written_to
}
