//! Display file the reader page polls.

use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Text file served next to the reader page
#[derive(Debug, Clone)]
pub struct DisplayFile {
    path: PathBuf,
}

impl DisplayFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DisplayFile { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the file with `sentence` followed by a newline.
    ///
    /// Writes a sibling temp file and renames it over the target, so a
    /// concurrent reader sees either the old or the new content.
    pub async fn write(&self, sentence: &str) -> io::Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }

        let tmp = self.tmp_path();
        let mut contents = String::with_capacity(sentence.len() + 1);
        contents.push_str(sentence);
        contents.push('\n');

        tokio::fs::write(&tmp, contents).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }

        debug!(path = %self.path.display(), len = sentence.len(), "Display file written");
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let file = DisplayFile::new(dir.path().join("helloClient.txt"));

        file.write("Hello Client!").await.unwrap();
        assert_eq!(
            tokio::fs::read_to_string(file.path()).await.unwrap(),
            "Hello Client!\n"
        );

        file.write("second").await.unwrap();
        assert_eq!(
            tokio::fs::read_to_string(file.path()).await.unwrap(),
            "second\n"
        );
        assert!(!dir.path().join("helloClient.txt.tmp").exists());
    }

    #[tokio::test]
    async fn test_write_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = DisplayFile::new(dir.path().join("kindleScreen").join("helloClient.txt"));

        file.write("nested").await.unwrap();
        assert_eq!(
            tokio::fs::read_to_string(file.path()).await.unwrap(),
            "nested\n"
        );
    }
}
