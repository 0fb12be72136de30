//! The static proving/verifying parameter files the daemon needs before it
//! will start. Presence is the only check; contents are never validated.

use std::path::{Path, PathBuf};

pub const DEFAULT_PARAMS_BASE_URL: &str = "https://z.cash/downloads/";

/// One required file, named relative to the parameter directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParamFile {
    name: String,
    url: String,
}

impl ParamFile {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self { name: name.into(), url: url.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn path_in(&self, params_dir: &Path) -> PathBuf {
        params_dir.join(&self.name)
    }

    pub fn is_present(&self, params_dir: &Path) -> bool {
        self.path_in(params_dir).is_file()
    }
}

/// Ordered set of required files. The order is the download priority and is
/// stable across runs so an interrupted bootstrap resumes deterministically.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParamFileSet {
    files: Vec<ParamFile>,
}

impl ParamFileSet {
    pub fn new(files: Vec<ParamFile>) -> Self {
        Self { files }
    }

    /// The sprout proving and verifying keys, fetched from `base_url`.
    pub fn sprout(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self::new(
            ["sprout-proving.key", "sprout-verifying.key"]
                .into_iter()
                .map(|name| ParamFile::new(name, format!("{base}/{name}")))
                .collect(),
        )
    }

    pub fn files(&self) -> &[ParamFile] {
        &self.files
    }

    pub fn all_present(&self, params_dir: &Path) -> bool {
        self.files.iter().all(|file| file.is_present(params_dir))
    }

    pub fn missing(&self, params_dir: &Path) -> Vec<ParamFile> {
        self.files.iter().filter(|file| !file.is_present(params_dir)).cloned().collect()
    }
}

impl Default for ParamFileSet {
    fn default() -> Self {
        Self::sprout(DEFAULT_PARAMS_BASE_URL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn default_set_points_at_sprout_keys() {
        let set = ParamFileSet::default();
        let urls: Vec<_> = set.files().iter().map(ParamFile::url).collect();
        assert_eq!(urls, vec!["https://z.cash/downloads/sprout-proving.key", "https://z.cash/downloads/sprout-verifying.key"]);
    }

    #[test]
    fn missing_keeps_priority_order_and_all_present_needs_every_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let set = ParamFileSet::sprout("http://127.0.0.1:1/params/");
        assert!(!set.all_present(dir.path()));
        assert_eq!(set.missing(dir.path()).len(), 2);

        fs::write(dir.path().join("sprout-verifying.key"), b"vk").expect("write vk");
        let missing = set.missing(dir.path());
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].name(), "sprout-proving.key");
        assert_eq!(missing[0].url(), "http://127.0.0.1:1/params/sprout-proving.key");
        assert!(!set.all_present(dir.path()));

        fs::write(dir.path().join("sprout-proving.key"), b"pk").expect("write pk");
        assert!(set.all_present(dir.path()));
        assert!(set.missing(dir.path()).is_empty());
    }

    #[test]
    fn partial_download_does_not_count_as_present() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("sprout-proving.key.part"), b"half").expect("write part");
        let file = ParamFile::new("sprout-proving.key", "http://example/sprout-proving.key");
        assert!(!file.is_present(dir.path()));
    }
}
