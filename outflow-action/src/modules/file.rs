//! Append records to a local file.
//!
//! Records are buffered while a transaction is open and flushed on commit.
//! The file is opened lazily and closed on a reload signal, so that log
//! rotation only needs to move the file and signal the daemon.

use std::{
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    path::PathBuf,
};

use outflow_common::tracing;

use crate::{
    error::{ConfigError, ModuleError},
    module::{BindContext, OutputModule},
    template::ActionParams,
};

#[derive(Debug)]
pub struct FileOutput {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl FileOutput {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
        }
    }

    fn classify(&self, error: &io::Error) -> ModuleError {
        let message = format!("{}: {error}", self.path.display());
        if error.kind() == io::ErrorKind::PermissionDenied {
            ModuleError::Fatal(message)
        } else {
            ModuleError::Transient(message)
        }
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>, ModuleError> {
        if self.writer.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|e| self.classify(&e))?;
            tracing::debug!(path = %self.path.display(), "Opened output file");
            self.writer = Some(BufWriter::new(file));
        }

        self.writer
            .as_mut()
            .ok_or_else(|| ModuleError::Transient(format!("{} is not open", self.path.display())))
    }

    fn write_line(&mut self, line: &[u8]) -> Result<(), ModuleError> {
        let result = self.writer()?.write_all(line);
        result.map_err(|e| {
            // Reopen on the next attempt.
            self.writer = None;
            self.classify(&e)
        })
    }
}

impl OutputModule for FileOutput {
    fn name(&self) -> &str {
        "file"
    }

    fn construct(&mut self, context: &BindContext) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::ModuleRejected(format!(
                "file output of action {} has no path",
                context.action_name
            )));
        }
        Ok(())
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    fn deliver(&mut self, params: &ActionParams) -> Result<(), ModuleError> {
        match params {
            ActionParams::Strings(strings) => {
                let line = strings.first().cloned().unwrap_or_default();
                self.write_line(line.as_bytes())
            }
            ActionParams::Arrays(arrays) => {
                let mut line = arrays.first().map(|fields| fields.join(" ")).unwrap_or_default();
                line.push('\n');
                self.write_line(line.as_bytes())
            }
            ActionParams::Record(record) => {
                let line = format!("{}{}\n", record.tag, record.message);
                self.write_line(line.as_bytes())
            }
        }
    }

    fn commit(&mut self) -> Result<(), ModuleError> {
        let result = self.writer()?.flush();
        result.map_err(|e| {
            self.writer = None;
            self.classify(&e)
        })
    }

    fn try_resume(&mut self) -> Result<(), ModuleError> {
        self.writer().map(|_| ())
    }

    fn on_reload_signal(&mut self) -> Result<(), ModuleError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(|e| self.classify(&e))?;
        }
        tracing::debug!(path = %self.path.display(), "Closed output file for reopen");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use outflow_common::LogRecord;

    use super::*;

    #[test]
    fn test_writes_and_reopens_after_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages");
        let rotated = dir.path().join("messages.1");
        let mut output = FileOutput::new(&path);

        output.begin_transaction().unwrap();
        output
            .deliver(&ActionParams::Strings(vec!["first\n".to_string()]))
            .unwrap();
        output.commit().unwrap();

        std::fs::rename(&path, &rotated).unwrap();
        output.on_reload_signal().unwrap();

        let record = Arc::new(LogRecord::new("h", "app:", " second"));
        output.deliver(&ActionParams::Record(record)).unwrap();
        output.commit().unwrap();

        assert_eq!(std::fs::read_to_string(&rotated).unwrap(), "first\n");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "app: second\n");
    }

    #[test]
    fn test_missing_directory_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let mut output = FileOutput::new(dir.path().join("missing").join("messages"));
        let error = output.try_resume().unwrap_err();
        assert!(error.is_transient());
    }

    #[test]
    fn test_empty_path_is_rejected() {
        let mut output = FileOutput::new("");
        let context = BindContext {
            action_name: "local".to_string(),
            templates: Vec::new(),
            queued: false,
        };
        assert!(matches!(
            output.construct(&context),
            Err(ConfigError::ModuleRejected(_))
        ));
    }
}
