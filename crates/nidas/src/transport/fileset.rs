// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 NCAR EOL ISF

//! [`FileSet`]: an [`IOChannel`] backed by a sequence of timestamped files
//! with automatic rollover (§4.5/§6), grounded on
//! `original_source/dsm/class/FileSet.h` for the channel shape and
//! `hdds-recording::rotation::RotationPolicy` for the rollover trigger and
//! filename-pattern abstractions.

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local};

use super::iochannel::{ConnectionRequester, IOChannel};

/// When a [`FileSet`] rolls to a new file (§6: "size exceeds a configured
/// cap or wall-clock crosses a configured period boundary").
#[derive(Debug, Clone, Copy)]
pub enum RolloverTrigger {
    Size(u64),
    Duration(Duration),
}

/// A sequence of timestamped files an output stream writes through,
/// rolling over on size or wall-clock boundaries (§4.5).
pub struct FileSet {
    dir: PathBuf,
    prefix: String,
    ext: String,
    trigger: RolloverTrigger,
    current: Option<File>,
    current_path: Option<PathBuf>,
    current_bytes: u64,
    current_opened_at: Option<SystemTime>,
}

impl FileSet {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, ext: impl Into<String>, trigger: RolloverTrigger) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            ext: ext.into(),
            trigger,
            current: None,
            current_path: None,
            current_bytes: 0,
            current_opened_at: None,
        }
    }

    /// Creates a new file named `<prefix>_<YYYYMMDD_HHMMSS>.<ext>` (§6) and
    /// returns the wall-clock instant it started, closing any file
    /// currently open.
    pub fn create_file(&mut self, at: SystemTime) -> io::Result<SystemTime> {
        if let Some(mut f) = self.current.take() {
            f.flush()?;
        }
        let dt: DateTime<Local> = at.into();
        let name = format!(
            "{}_{}.{}",
            self.prefix,
            dt.format("%Y%m%d_%H%M%S"),
            self.ext
        );
        let path = self.dir.join(name);
        let file = File::create(&path)?;
        self.current = Some(file);
        self.current_path = Some(path);
        self.current_bytes = 0;
        self.current_opened_at = Some(at);
        Ok(at)
    }

    fn needs_rollover(&self, additional_bytes: usize) -> bool {
        match self.trigger {
            RolloverTrigger::Size(max) => self.current_bytes + additional_bytes as u64 > max,
            RolloverTrigger::Duration(period) => self
                .current_opened_at
                .and_then(|opened| SystemTime::now().duration_since(opened).ok())
                .map(|elapsed| elapsed >= period)
                .unwrap_or(false),
        }
    }

    pub fn current_path(&self) -> Option<&PathBuf> {
        self.current_path.as_ref()
    }
}

impl IOChannel for FileSet {
    fn request_connection(&mut self, requester: &dyn ConnectionRequester) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        self.create_file(SystemTime::now())?;
        requester.connected();
        Ok(())
    }

    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "FileSet opened for output does not support read",
        ))
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.current.is_none() || self.needs_rollover(buf.len()) {
            self.create_file(SystemTime::now())?;
        }
        let file = self
            .current
            .as_mut()
            .expect("create_file always sets current");
        let n = file.write(buf)?;
        self.current_bytes += n as u64;
        Ok(n)
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(mut f) = self.current.take() {
            f.flush()?;
        }
        Ok(())
    }

    fn name(&self) -> String {
        self.current_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| format!("{}/{}_*.{}", self.dir.display(), self.prefix, self.ext))
    }

    fn clone_channel(&self) -> Box<dyn IOChannel> {
        Box::new(FileSet::new(
            self.dir.clone(),
            self.prefix.clone(),
            self.ext.clone(),
            self.trigger,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    struct NoopRequester;
    impl ConnectionRequester for NoopRequester {}

    #[test]
    fn rolls_over_on_size_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = FileSet::new(dir.path(), "flight", "dat", RolloverTrigger::Size(8));
        fs.request_connection(&NoopRequester).unwrap();
        let first_path = fs.current_path().unwrap().clone();

        fs.write(b"0123456789").unwrap(); // exceeds the 8 byte cap
        let second_path = fs.current_path().unwrap().clone();
        assert_ne!(first_path, second_path);
    }

    #[test]
    fn filename_matches_prefix_timestamp_ext_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = FileSet::new(dir.path(), "flight", "dat", RolloverTrigger::Size(u64::MAX));
        fs.request_connection(&NoopRequester).unwrap();
        let name = fs.current_path().unwrap().file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("flight_"));
        assert!(name.ends_with(".dat"));
    }

    #[test]
    fn duration_trigger_does_not_roll_before_period_elapses() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = FileSet::new(
            dir.path(),
            "flight",
            "dat",
            RolloverTrigger::Duration(StdDuration::from_secs(3600)),
        );
        fs.request_connection(&NoopRequester).unwrap();
        let first_path = fs.current_path().unwrap().clone();
        fs.write(b"hello").unwrap();
        assert_eq!(fs.current_path().unwrap(), &first_path);
    }
}
