use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use crate::transport::Role;

pub trait Logger: Send + Sync {
    fn session_start(&self, _session: &str, _root: &Path, _role: Role) {}
    fn changes(
        &self,
        _direction: &str,
        _added: &[String],
        _deleted: &[String],
        _modified: &[String],
    ) {
    }
    fn pulled(&self, _path: &str, _bytes: u64) {}
    fn served(&self, _path: &str, _bytes: u64) {}
    fn deleted(&self, _path: &str) {}
    fn error(&self, _context: &str, _msg: &str) {}
    fn debug(&self, _msg: &str) {}
    fn done(&self, _session: &str, _files: u64, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

/// Renders every event as one `EVENT key=value` line.
pub trait LineSink: Send + Sync {
    fn line(&self, s: &str);
}

impl<T: LineSink> Logger for T {
    fn session_start(&self, session: &str, root: &Path, role: Role) {
        self.line(&format!("START session={} root={} role={}", session, root.display(), role));
    }
    fn changes(&self, direction: &str, added: &[String], deleted: &[String], modified: &[String]) {
        self.line(&format!(
            "CHANGES {direction} added={added:?} deleted={deleted:?} modified={modified:?}"
        ));
    }
    fn pulled(&self, path: &str, bytes: u64) {
        self.line(&format!("PULL path={} bytes={}", path, bytes));
    }
    fn served(&self, path: &str, bytes: u64) {
        self.line(&format!("SERVE path={} bytes={}", path, bytes));
    }
    fn deleted(&self, path: &str) {
        self.line(&format!("DELETE path={}", path));
    }
    fn error(&self, context: &str, msg: &str) {
        self.line(&format!("ERROR ctx={} msg={}", context, msg));
    }
    fn debug(&self, msg: &str) {
        self.line(&format!("DEBUG {msg}"));
    }
    fn done(&self, session: &str, files: u64, bytes: u64, seconds: f64) {
        self.line(&format!(
            "DONE session={session} files={files} bytes={bytes} seconds={seconds:.3}"
        ));
    }
}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }
}

impl LineSink for TextLogger {
    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

/// Debug output on stderr.
pub struct ConsoleLogger;

impl LineSink for ConsoleLogger {
    fn line(&self, s: &str) {
        eprintln!("[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

/// Fans every event out to several loggers.
pub struct TeeLogger(pub Vec<Box<dyn Logger>>);

impl Logger for TeeLogger {
    fn session_start(&self, session: &str, root: &Path, role: Role) {
        self.0.iter().for_each(|l| l.session_start(session, root, role));
    }
    fn changes(&self, direction: &str, added: &[String], deleted: &[String], modified: &[String]) {
        self.0.iter().for_each(|l| l.changes(direction, added, deleted, modified));
    }
    fn pulled(&self, path: &str, bytes: u64) {
        self.0.iter().for_each(|l| l.pulled(path, bytes));
    }
    fn served(&self, path: &str, bytes: u64) {
        self.0.iter().for_each(|l| l.served(path, bytes));
    }
    fn deleted(&self, path: &str) {
        self.0.iter().for_each(|l| l.deleted(path));
    }
    fn error(&self, context: &str, msg: &str) {
        self.0.iter().for_each(|l| l.error(context, msg));
    }
    fn debug(&self, msg: &str) {
        self.0.iter().for_each(|l| l.debug(msg));
    }
    fn done(&self, session: &str, files: u64, bytes: u64, seconds: f64) {
        self.0.iter().for_each(|l| l.done(session, files, bytes, seconds));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn text_logger_appends_timestamped_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("logs").join("sync.log");
        {
            let logger = TextLogger::new(&path).unwrap();
            logger.session_start("s1", Path::new("/data"), Role::Answer);
            logger.pulled("dir/a.txt", 5);
            logger.done("s1", 1, 5, 0.25);
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].contains("START session=s1 root=/data role=answer"));
        assert!(lines[1].contains("PULL path=dir/a.txt bytes=5"));
        assert!(lines[2].contains("DONE session=s1 files=1 bytes=5 seconds=0.250"));
    }

    #[test]
    fn tee_reaches_every_logger() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.log");
        let b = tmp.path().join("b.log");
        let tee = TeeLogger(vec![
            Box::new(TextLogger::new(&a).unwrap()),
            Box::new(NoopLogger),
            Box::new(TextLogger::new(&b).unwrap()),
        ]);
        tee.deleted("gone.txt");
        for p in [a, b] {
            assert!(std::fs::read_to_string(p).unwrap().contains("DELETE path=gone.txt"));
        }
    }
}
