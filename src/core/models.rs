use std::path::Path;
use std::time::Duration;

/// A dump file on the remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpArtifact {
    pub path: String,
    pub size: u64,
    /// Delete from the remote host once every upload of the job has finished.
    pub remove: bool,
}

impl DumpArtifact {
    pub fn new(path: impl Into<String>, size: u64, remove: bool) -> Self {
        Self {
            path: path.into(),
            size,
            remove,
        }
    }

    /// File name used at every destination.
    pub fn file_name(&self) -> &str {
        Path::new(&self.path)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&self.path)
    }
}

/// The command-generation collaborator's output: an opaque shell command and
/// the remote path it produces.
#[derive(Debug, Clone)]
pub struct DumpCommand {
    pub command: String,
    pub artifact_path: String,
}

/// Outcome of the fan-out upload phase.
#[derive(Debug, Default)]
pub struct UploadReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<super::storage::UploadError>,
    pub bytes: u64,
    pub removed: Vec<String>,
}

impl UploadReport {
    pub fn targets(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

/// Outcome of one database's backup.
#[derive(Debug)]
pub struct BackupReport {
    pub database: String,
    pub artifacts: Vec<DumpArtifact>,
    pub dump_duration: Option<Duration>,
    pub upload: UploadReport,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_is_basename() {
        let artifact = DumpArtifact::new("/tmp/sshdump/app.sql.gz", 10, false);
        assert_eq!(artifact.file_name(), "app.sql.gz");
    }

    #[test]
    fn file_name_of_bare_name() {
        let artifact = DumpArtifact::new("app.sql", 10, false);
        assert_eq!(artifact.file_name(), "app.sql");
    }
}
