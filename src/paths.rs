//! Recording file naming.
//!
//! Capture output is named `recording_<YYYYMMDD_HHMMSS>.wav` in the watch
//! folder. Names are second-resolution, so a start/stop/start cycle inside
//! one second would collide; the namer tracks the last issued timestamp and
//! disambiguates with a numeric suffix so a path is never reused within a
//! process lifetime.

use chrono::Local;
use std::path::PathBuf;

pub struct RecordingNamer {
    folder: PathBuf,
    last_timestamp: Option<String>,
    collisions: u32,
}

impl RecordingNamer {
    pub fn new(folder: PathBuf) -> Self {
        Self {
            folder,
            last_timestamp: None,
            collisions: 0,
        }
    }

    /// Generate the path for the next recording.
    pub fn next(&mut self) -> PathBuf {
        let timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        self.next_for_timestamp(timestamp)
    }

    fn next_for_timestamp(&mut self, timestamp: String) -> PathBuf {
        if self.last_timestamp.as_deref() == Some(timestamp.as_str()) {
            self.collisions += 1;
        } else {
            self.collisions = 0;
            self.last_timestamp = Some(timestamp.clone());
        }

        let filename = if self.collisions == 0 {
            format!("recording_{}.wav", timestamp)
        } else {
            format!("recording_{}_{}.wav", timestamp, self.collisions)
        };
        self.folder.join(filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_has_expected_shape() {
        let mut namer = RecordingNamer::new(PathBuf::from("/tmp/audio"));
        let path = namer.next();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("recording_"));
        assert!(name.ends_with(".wav"));
        // recording_YYYYMMDD_HHMMSS.wav
        assert_eq!(name.len(), "recording_20240101_120000.wav".len());
    }

    #[test]
    fn same_second_gets_a_suffix() {
        let mut namer = RecordingNamer::new(PathBuf::from("/tmp/audio"));
        let first = namer.next_for_timestamp("20240101_120000".to_string());
        let second = namer.next_for_timestamp("20240101_120000".to_string());
        let third = namer.next_for_timestamp("20240101_120000".to_string());
        assert_eq!(first, PathBuf::from("/tmp/audio/recording_20240101_120000.wav"));
        assert_eq!(
            second,
            PathBuf::from("/tmp/audio/recording_20240101_120000_1.wav")
        );
        assert_eq!(
            third,
            PathBuf::from("/tmp/audio/recording_20240101_120000_2.wav")
        );
    }

    #[test]
    fn new_second_resets_the_counter() {
        let mut namer = RecordingNamer::new(PathBuf::from("/tmp/audio"));
        namer.next_for_timestamp("20240101_120000".to_string());
        namer.next_for_timestamp("20240101_120000".to_string());
        let fresh = namer.next_for_timestamp("20240101_120001".to_string());
        assert_eq!(fresh, PathBuf::from("/tmp/audio/recording_20240101_120001.wav"));
    }
}
