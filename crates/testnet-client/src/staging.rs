//! Generated-file staging on the suite execution volume.
//!
//! The volume is mounted at one root on the runner and at another inside
//! each container. A generated file lives at the same relative path under
//! both roots, so the in-container path is obtained by swapping the prefix.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use uuid::Uuid;

use testnet_common::ServiceId;

use crate::config::{is_plain_relative, VolumeConfig};
use crate::services::FileInitializer;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("generated file '{file_id}' would clobber existing file {}", .path.display())]
    Collision { file_id: String, path: PathBuf },
    #[error("path {} is not inside the suite execution volume", .0.display())]
    OutsideVolume(PathBuf),
    #[error("no initializer for generated file '{0}'")]
    MissingInitializer(String),
    #[error("I/O error staging generated file '{file_id}' at {}", .path.display())]
    Io {
        file_id: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("initializer for generated file '{file_id}' failed")]
    Initializer {
        file_id: String,
        #[source]
        source: anyhow::Error,
    },
}

/// One staged file, at its runner-side and in-container locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFile {
    pub file_id: String,
    pub runner_path: PathBuf,
    pub container_path: PathBuf,
}

/// Map an absolute runner-side path to the same file inside a container.
pub fn translate_path(
    runner_root: &Path,
    container_root: &Path,
    runner_path: &Path,
) -> Result<PathBuf, StagingError> {
    let relative = runner_path
        .strip_prefix(runner_root)
        .map_err(|_| StagingError::OutsideVolume(runner_path.to_path_buf()))?;
    if !is_plain_relative(relative) {
        return Err(StagingError::OutsideVolume(runner_path.to_path_buf()));
    }
    Ok(container_root.join(relative))
}

#[derive(Debug, Clone)]
pub struct Stager {
    runner_root: PathBuf,
    services_relative_dirpath: PathBuf,
}

impl Stager {
    pub fn new(runner_root: impl Into<PathBuf>, services_relative_dirpath: impl Into<PathBuf>) -> Self {
        Self {
            runner_root: runner_root.into(),
            services_relative_dirpath: services_relative_dirpath.into(),
        }
    }

    pub fn from_config(config: &VolumeConfig) -> Self {
        Self::new(
            &config.suite_execution_volume_dirpath,
            &config.services_relative_dirpath,
        )
    }

    pub fn runner_root(&self) -> &Path {
        &self.runner_root
    }

    /// Collision-free relative path for a file the engine didn't place:
    /// `<services dir>/<service id>/<file id>-<uuid>`.
    pub fn allocate_relative_path(&self, service_id: &ServiceId, file_id: &str) -> PathBuf {
        let filename = format!("{}-{}", file_id, Uuid::now_v7().as_simple());
        self.services_relative_dirpath
            .join(service_id.as_str())
            .join(filename)
    }

    /// Create, initialize and close every requested generated file.
    ///
    /// `engine_paths` holds the relative paths the engine chose; files it
    /// didn't place get a locally allocated path. All files are flushed and
    /// closed when this returns, whether it succeeds or not.
    pub fn stage(
        &self,
        service_id: &ServiceId,
        initializers: &BTreeMap<String, FileInitializer>,
        engine_paths: &BTreeMap<String, String>,
        container_root: &Path,
    ) -> Result<BTreeMap<String, GeneratedFile>, StagingError> {
        if let Some(unknown) = engine_paths.keys().find(|id| !initializers.contains_key(*id)) {
            return Err(StagingError::MissingInitializer(unknown.clone()));
        }

        let mut staged = BTreeMap::new();
        for (file_id, initializer) in initializers {
            match self.stage_one(service_id, file_id, initializer, engine_paths, container_root) {
                Ok(file) => {
                    staged.insert(file_id.clone(), file);
                }
                Err(e) => {
                    discard(&staged);
                    return Err(e);
                }
            }
        }
        Ok(staged)
    }

    fn stage_one(
        &self,
        service_id: &ServiceId,
        file_id: &str,
        initializer: &FileInitializer,
        engine_paths: &BTreeMap<String, String>,
        container_root: &Path,
    ) -> Result<GeneratedFile, StagingError> {
        let relative = match engine_paths.get(file_id) {
            Some(path) => PathBuf::from(path),
            None => self.allocate_relative_path(service_id, file_id),
        };
        if !is_plain_relative(&relative) {
            return Err(StagingError::OutsideVolume(relative));
        }

        let runner_path = self.runner_root.join(&relative);
        let container_path = translate_path(&self.runner_root, container_root, &runner_path)?;

        tracing::debug!(
            service_id = %service_id,
            file_id = %file_id,
            path = %runner_path.display(),
            "staging generated file"
        );
        write_generated_file(file_id, &runner_path, initializer)?;

        Ok(GeneratedFile {
            file_id: file_id.to_string(),
            runner_path,
            container_path,
        })
    }
}

/// Delete staged files from the volume. Files already gone are skipped.
pub fn discard(files: &BTreeMap<String, GeneratedFile>) {
    for file in files.values() {
        match std::fs::remove_file(&file.runner_path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                file_id = %file.file_id,
                path = %file.runner_path.display(),
                error = %e,
                "could not delete staged file"
            ),
        }
    }
}

fn write_generated_file(
    file_id: &str,
    path: &Path,
    initializer: &FileInitializer,
) -> Result<(), StagingError> {
    let io_err = |source: io::Error| StagingError::Io {
        file_id: file_id.to_string(),
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => StagingError::Collision {
                file_id: file_id.to_string(),
                path: path.to_path_buf(),
            },
            _ => io_err(e),
        })?;

    let filled = fill_generated_file(file, file_id, initializer).map_err(|e| match e {
        FillError::Initializer(source) => StagingError::Initializer {
            file_id: file_id.to_string(),
            source,
        },
        FillError::Io(source) => io_err(source),
    });
    if filled.is_err() {
        // the file is ours since create_new succeeded
        let _ = std::fs::remove_file(path);
    }
    filled
}

enum FillError {
    Initializer(anyhow::Error),
    Io(io::Error),
}

fn fill_generated_file(
    file: File,
    file_id: &str,
    initializer: &FileInitializer,
) -> Result<(), FillError> {
    let mut writer = BufWriter::new(file);
    initializer(&mut writer as &mut dyn Write).map_err(FillError::Initializer)?;
    writer.flush().map_err(FillError::Io)?;
    let file: File = writer
        .into_inner()
        .map_err(|e| FillError::Io(e.into_error()))?;
    file.sync_all().map_err(FillError::Io)?;
    tracing::trace!(file_id, "generated file written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn initializers(ids: &[&'static str]) -> BTreeMap<String, FileInitializer> {
        ids.iter()
            .map(|&id| {
                let init: FileInitializer = Box::new(move |w: &mut dyn Write| -> anyhow::Result<()> {
                    write!(w, "contents of {id}")?;
                    Ok(())
                });
                (id.to_string(), init)
            })
            .collect()
    }

    #[test]
    fn translates_volume_prefix() {
        let container = translate_path(
            Path::new("/suite-execution"),
            Path::new("/mnt"),
            Path::new("/suite-execution/svcA/f1"),
        )
        .unwrap();
        assert_eq!(container, PathBuf::from("/mnt/svcA/f1"));
    }

    #[test]
    fn translation_rejects_paths_outside_the_volume() {
        let err = translate_path(
            Path::new("/suite-execution"),
            Path::new("/mnt"),
            Path::new("/etc/passwd"),
        )
        .unwrap_err();
        assert!(matches!(err, StagingError::OutsideVolume(_)));
    }

    #[test]
    fn stages_engine_placed_files() {
        let root = tempfile::tempdir().unwrap();
        let stager = Stager::new(root.path(), "services");
        let engine_paths =
            BTreeMap::from([("config".to_string(), "services/datastore/config-1".to_string())]);

        let staged = stager
            .stage(
                &ServiceId::from("datastore"),
                &initializers(&["config"]),
                &engine_paths,
                Path::new("/test-volume"),
            )
            .unwrap();

        let file = &staged["config"];
        assert_eq!(file.runner_path, root.path().join("services/datastore/config-1"));
        assert_eq!(
            file.container_path,
            PathBuf::from("/test-volume/services/datastore/config-1")
        );
        let contents = std::fs::read_to_string(&file.runner_path).unwrap();
        assert_eq!(contents, "contents of config");
    }

    #[test]
    fn allocates_unique_paths_for_unplaced_files() {
        let root = tempfile::tempdir().unwrap();
        let stager = Stager::new(root.path(), "services");
        let service = ServiceId::from("api");

        let a = stager.allocate_relative_path(&service, "conf");
        let b = stager.allocate_relative_path(&service, "conf");
        assert_ne!(a, b);
        assert!(a.starts_with("services/api"));

        let staged = stager
            .stage(&service, &initializers(&["conf"]), &BTreeMap::new(), Path::new("/vol"))
            .unwrap();
        let file = &staged["conf"];
        assert!(file.runner_path.starts_with(root.path().join("services/api")));
        assert!(file.container_path.starts_with("/vol/services/api"));
        assert!(file.runner_path.exists());
    }

    #[test]
    fn refuses_to_clobber_existing_files() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("taken"), b"old").unwrap();
        let stager = Stager::new(root.path(), "services");
        let engine_paths = BTreeMap::from([("f".to_string(), "taken".to_string())]);

        let err = stager
            .stage(&ServiceId::from("s"), &initializers(&["f"]), &engine_paths, Path::new("/vol"))
            .unwrap_err();
        assert!(matches!(err, StagingError::Collision { .. }));
        assert_eq!(std::fs::read(root.path().join("taken")).unwrap(), b"old");
    }

    #[test]
    fn rejects_engine_paths_escaping_the_volume() {
        let root = tempfile::tempdir().unwrap();
        let stager = Stager::new(root.path(), "services");
        let engine_paths = BTreeMap::from([("f".to_string(), "../outside".to_string())]);

        let err = stager
            .stage(&ServiceId::from("s"), &initializers(&["f"]), &engine_paths, Path::new("/vol"))
            .unwrap_err();
        assert!(matches!(err, StagingError::OutsideVolume(_)));
    }

    #[test]
    fn initializer_failure_is_reported_with_file_id() {
        let root = tempfile::tempdir().unwrap();
        let stager = Stager::new(root.path(), "services");
        let mut inits: BTreeMap<String, FileInitializer> = BTreeMap::new();
        inits.insert(
            "broken".into(),
            Box::new(|_w: &mut dyn Write| -> anyhow::Result<()> { anyhow::bail!("template missing") }),
        );

        let err = stager
            .stage(&ServiceId::from("s"), &inits, &BTreeMap::new(), Path::new("/vol"))
            .unwrap_err();
        match err {
            StagingError::Initializer { file_id, source } => {
                assert_eq!(file_id, "broken");
                assert!(source.to_string().contains("template missing"));
            }
            other => panic!("expected Initializer error, got {other:?}"),
        }
    }

    #[test]
    fn failed_staging_leaves_nothing_behind() {
        let root = tempfile::tempdir().unwrap();
        let stager = Stager::new(root.path(), "services");
        let mut inits = initializers(&["a-config"]);
        inits.insert(
            "b-broken".into(),
            Box::new(|w: &mut dyn Write| -> anyhow::Result<()> {
                write!(w, "half a file")?;
                anyhow::bail!("template missing")
            }),
        );
        let engine_paths = BTreeMap::from([
            ("a-config".to_string(), "services/s/a-config".to_string()),
            ("b-broken".to_string(), "services/s/b-broken".to_string()),
        ]);

        let err = stager
            .stage(&ServiceId::from("s"), &inits, &engine_paths, Path::new("/vol"))
            .unwrap_err();
        assert!(matches!(err, StagingError::Initializer { .. }));
        assert!(!root.path().join("services/s/a-config").exists());
        assert!(!root.path().join("services/s/b-broken").exists());

        // the same paths can be staged again
        inits.insert("b-broken".into(), initializers(&["b-broken"]).remove("b-broken").unwrap());
        stager
            .stage(&ServiceId::from("s"), &inits, &engine_paths, Path::new("/vol"))
            .unwrap();
    }

    #[test]
    fn discard_skips_missing_files() {
        let root = tempfile::tempdir().unwrap();
        let stager = Stager::new(root.path(), "services");
        let staged = stager
            .stage(
                &ServiceId::from("s"),
                &initializers(&["one", "two"]),
                &BTreeMap::new(),
                Path::new("/vol"),
            )
            .unwrap();
        std::fs::remove_file(&staged["one"].runner_path).unwrap();

        discard(&staged);
        assert!(!staged["two"].runner_path.exists());
    }

    #[test]
    fn engine_path_without_initializer_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let stager = Stager::new(root.path(), "services");
        let engine_paths = BTreeMap::from([("ghost".to_string(), "services/s/ghost".to_string())]);

        let err = stager
            .stage(&ServiceId::from("s"), &BTreeMap::new(), &engine_paths, Path::new("/vol"))
            .unwrap_err();
        assert!(matches!(err, StagingError::MissingInitializer(id) if id == "ghost"));
    }
}
