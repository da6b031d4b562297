use std::path::Path;

/// Async file helpers for state files owned by the reconciler
pub struct FileSystemUtils;

impl FileSystemUtils {
    /// Write a file, creating parent directories first
    pub async fn write_file<P: AsRef<Path>>(path: P, content: &str) -> Result<(), String> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                format!(
                    "Failed to create parent directory '{}': {}",
                    parent.display(),
                    e
                )
            })?;
        }

        tokio::fs::write(path_ref, content)
            .await
            .map_err(|e| format!("Failed to write file '{}': {}", path_ref.display(), e))
    }

    /// Read file content as string
    pub async fn read_file<P: AsRef<Path>>(path: P) -> Result<String, String> {
        tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| format!("Failed to read file '{}': {}", path.as_ref().display(), e))
    }

    /// Remove a file; a missing file is not an error
    pub async fn remove_file<P: AsRef<Path>>(path: P) -> Result<(), String> {
        let path_ref = path.as_ref();
        match tokio::fs::remove_file(path_ref).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(format!("Failed to remove file '{}': {}", path_ref.display(), e)),
        }
    }

    /// Check if a path exists
    pub async fn exists<P: AsRef<Path>>(path: P) -> bool {
        tokio::fs::try_exists(path.as_ref()).await.unwrap_or(false)
    }

    /// Last `lines` lines of a text file, empty if it cannot be read
    pub async fn read_tail<P: AsRef<Path>>(path: P, lines: usize) -> Vec<String> {
        match tokio::fs::read_to_string(path.as_ref()).await {
            Ok(content) => {
                let all: Vec<&str> = content.lines().collect();
                let skip = all.len().saturating_sub(lines);
                all[skip..].iter().map(|l| l.to_string()).collect()
            }
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_creates_parents_and_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c.conf");

        FileSystemUtils::write_file(&path, "x=1\n").await.unwrap();
        assert!(FileSystemUtils::exists(&path).await);
        assert_eq!(FileSystemUtils::read_file(&path).await.unwrap(), "x=1\n");

        FileSystemUtils::remove_file(&path).await.unwrap();
        FileSystemUtils::remove_file(&path).await.unwrap();
        assert!(!FileSystemUtils::exists(&path).await);
    }

    #[tokio::test]
    async fn test_read_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        tokio::fs::write(&path, "1\n2\n3\n4\n").await.unwrap();

        assert_eq!(FileSystemUtils::read_tail(&path, 2).await, vec!["3", "4"]);
        assert_eq!(FileSystemUtils::read_tail(&path, 10).await.len(), 4);
        assert!(FileSystemUtils::read_tail(dir.path().join("missing"), 5)
            .await
            .is_empty());
    }
}
