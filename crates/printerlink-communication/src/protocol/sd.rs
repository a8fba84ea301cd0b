//! SD card listing and progress tracking

use printerlink_core::{parse_m27, EtaEstimator, SdFile, SdProgress};

/// First line of an M20 listing
pub const BEGIN_FILE_LIST: &str = "Begin file list";
/// Last line of an M20 listing
pub const END_FILE_LIST: &str = "End file list";

/// Consecutive "not sd printing" reports needed to reset progress
const NOT_PRINTING_RESET_STREAK: u32 = 2;

/// Parse the lines captured between the listing markers
///
/// Each entry is `NAME [SIZE]`; the name is everything before the trailing
/// integer, which is taken as the size. A `long filename: X` line renames the
/// previous entry.
pub fn parse_file_list<S: AsRef<str>>(lines: &[S]) -> Vec<SdFile> {
    let mut files: Vec<SdFile> = Vec::new();

    for line in lines {
        let line = line.as_ref().trim();
        if line.is_empty() {
            continue;
        }

        if let Some(long_name) = strip_prefix_ignore_case(line, "long filename:") {
            if let Some(last) = files.last_mut() {
                let long_name = long_name.trim();
                if !long_name.is_empty() {
                    last.display_name = long_name.to_string();
                }
            }
            continue;
        }

        let (name, size) = split_trailing_size(line);
        if name.is_empty() {
            continue;
        }
        files.push(SdFile {
            name: name.to_string(),
            display_name: name.to_string(),
            size,
        });
    }

    files
}

fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        line.get(prefix.len()..)
    } else {
        None
    }
}

/// Split `NAME 12345` into the name and the longest trailing integer
fn split_trailing_size(line: &str) -> (&str, Option<u64>) {
    let digits = line
        .bytes()
        .rev()
        .take_while(|b| b.is_ascii_digit())
        .count();
    if digits == 0 || digits == line.len() {
        return (line, None);
    }
    let split_at = line.len() - digits;
    let (head, tail) = line.split_at(split_at);
    // the size must be its own token
    if !head.ends_with(char::is_whitespace) {
        return (line, None);
    }
    match tail.parse::<u64>() {
        Ok(size) => (head.trim_end(), Some(size)),
        Err(_) => (line, None),
    }
}

/// SD progress derived from M27 reports
pub struct SdProgressTracker {
    progress: SdProgress,
    not_printing_streak: u32,
    eta: EtaEstimator,
}

impl SdProgressTracker {
    /// Create an idle tracker
    pub fn new(eta: EtaEstimator) -> Self {
        Self {
            progress: SdProgress::default(),
            not_printing_streak: 0,
            eta,
        }
    }

    /// Current progress snapshot
    pub fn progress(&self) -> &SdProgress {
        &self.progress
    }

    /// Forget the current job
    pub fn reset(&mut self) {
        self.progress = SdProgress::default();
        self.not_printing_streak = 0;
        self.eta.reset();
    }

    /// Feed one received line; returns the new snapshot when it changed
    ///
    /// Lines that are neither a progress report nor "not sd printing" leave
    /// the streak untouched.
    pub fn observe(&mut self, line: &str) -> Option<SdProgress> {
        if line.to_lowercase().contains("not sd printing") {
            self.not_printing_streak += 1;
            if self.not_printing_streak == NOT_PRINTING_RESET_STREAK {
                tracing::debug!("SD printing stopped, resetting progress");
                let was_active = self.progress.active;
                self.progress = SdProgress::default();
                self.eta.reset();
                return was_active.then(|| self.progress.clone());
            }
            return None;
        }

        let (done, total) = parse_m27(line)?;
        self.not_printing_streak = 0;
        let report = self.eta.update(done, total);
        self.progress = SdProgress {
            active: true,
            completion: report.progress,
            printed_bytes: done,
            total_bytes: total,
            eta_sec: report.remaining_s,
            last_update: Some(chrono::Utc::now()),
        };
        Some(self.progress.clone())
    }

    /// Formatted remaining time of the current job
    pub fn eta_string(&self) -> String {
        printerlink_core::fmt_hms(self.progress.eta_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_list() {
        let files = parse_file_list(&[
            "CUBE~1.GCO 123456",
            "long filename: calibration cube.gcode",
            "FOLDER/PART.GCO 42",
            "NOSIZE.GCO",
        ]);
        assert_eq!(files.len(), 3);
        assert_eq!(files[0].name, "CUBE~1.GCO");
        assert_eq!(files[0].display_name, "calibration cube.gcode");
        assert_eq!(files[0].size, Some(123456));
        assert_eq!(files[1].display_name, "FOLDER/PART.GCO");
        assert_eq!(files[2].size, None);
    }

    #[test]
    fn test_trailing_digits_in_name_are_not_a_size() {
        let files = parse_file_list(&["BENCHY2"]);
        assert_eq!(files[0].name, "BENCHY2");
        assert_eq!(files[0].size, None);
    }

    #[test]
    fn test_two_not_printing_reset() {
        let mut tracker = SdProgressTracker::new(EtaEstimator::default());
        assert!(tracker.observe("SD printing byte 500/1000").is_some());
        assert!((tracker.progress().completion - 50.0).abs() < 1e-9);

        assert!(tracker.observe("Not SD printing").is_none());
        assert!(tracker.progress().active);
        assert_eq!(tracker.progress().printed_bytes, 500);

        let reset = tracker.observe("Not SD printing").unwrap();
        assert!(!reset.active);
        assert_eq!(reset.printed_bytes, 0);
        assert_eq!(tracker.eta_string(), "--:--:--");
    }

    #[test]
    fn test_progress_report_breaks_streak() {
        let mut tracker = SdProgressTracker::new(EtaEstimator::default());
        tracker.observe("SD printing byte 100/1000");
        tracker.observe("Not SD printing");
        tracker.observe("ok");
        tracker.observe("SD printing byte 200/1000");
        tracker.observe("Not SD printing");
        assert!(tracker.progress().active);
        assert_eq!(tracker.progress().printed_bytes, 200);
    }

    #[test]
    fn test_completion_stays_active() {
        let mut tracker = SdProgressTracker::new(EtaEstimator::default());
        let progress = tracker.observe("SD printing byte 1000/1000").unwrap();
        assert!(progress.active);
        assert!(progress.is_complete());
        assert!(tracker.observe("SD printing byte 0/0").is_none());
    }
}
