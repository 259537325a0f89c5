use crate::status::{percent_of, Phase, ProgressUpdate, StatusSink};

/// Running totals of a copy phase.
///
/// The overall percentage counts the planned size of finished files plus the
/// completed fraction of the current one. An update goes to the sink each
/// time that integer percentage changes.
pub struct CopyProgress<'s> {
    sink: &'s mut dyn StatusSink,
    total_bytes: u64,
    total_files: usize,
    done_bytes: u64,
    current: usize,
    file: String,
    file_size: u64,
    last_percent: Option<u32>,
}

impl<'s> CopyProgress<'s> {
    pub fn new(sink: &'s mut dyn StatusSink, total_bytes: u64, total_files: usize) -> Self {
        Self {
            sink,
            total_bytes,
            total_files,
            done_bytes: 0,
            current: 0,
            file: String::new(),
            file_size: 0,
            last_percent: None,
        }
    }

    pub fn start_file(&mut self, index: usize, name: String, size: u64) {
        self.current = index + 1;
        self.file = name;
        self.file_size = size;
    }

    /// Report `done` of `total` units of the current file
    pub fn file_progress(&mut self, done: u64, total: u64) {
        let file_percent = percent_of(done, total);
        let partial = (u128::from(self.file_size) * u128::from(file_percent) / 100) as u64;
        self.emit(self.done_bytes + partial, file_percent);
    }

    /// The current file is done, whatever its outcome
    pub fn finish_file(&mut self) {
        self.done_bytes += self.file_size;
        self.emit(self.done_bytes, 100);
    }

    pub fn sink(&mut self) -> &mut dyn StatusSink {
        &mut *self.sink
    }

    fn emit(&mut self, bytes: u64, file_percent: u32) {
        let percent = percent_of(bytes, self.total_bytes);
        if self.last_percent == Some(percent) {
            return;
        }
        self.last_percent = Some(percent);
        self.sink.progress(&ProgressUpdate {
            phase: Phase::Copying,
            percent,
            current: self.current,
            total: self.total_files,
            file: self.file.clone(),
            file_percent,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{MessageKey, Severity};
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Recorder(Vec<(u32, usize, u32)>);

    impl StatusSink for Recorder {
        fn progress(&mut self, update: &ProgressUpdate) {
            self.0.push((update.percent, update.current, update.file_percent));
        }

        fn message(&mut self, _: Severity, _: MessageKey, _: &[(&str, String)]) {}
    }

    #[test]
    fn test_overall_includes_partial_file() {
        let mut recorder = Recorder::default();
        {
            let mut progress = CopyProgress::new(&mut recorder, 200, 2);
            progress.start_file(0, "a".to_string(), 100);
            progress.file_progress(50, 100);
            progress.file_progress(50, 100);
            progress.finish_file();
            progress.start_file(1, "b".to_string(), 100);
            progress.file_progress(1, 4);
            progress.finish_file();
        }

        assert_eq!(
            recorder.0,
            vec![(25, 1, 50), (50, 1, 100), (62, 2, 25), (100, 2, 100)]
        );
    }
}
