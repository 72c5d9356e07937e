//! Post-unpack install tasks.
//!
//! Tasks run strictly in order against the unpacked install directory. The
//! first failure aborts the rest. A pipeline may be re-run over a directory a
//! previous attempt already partly processed, so every task tolerates finding
//! its work already done.

use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, warn};

use super::{InstallError, ProcessConfig};

/// File name written by `EnvironmentFileTask`, relative to the install root.
pub const ENVIRONMENT_FILE: &str = "etc/environment";

/// Mutable state threaded through one pipeline run.
#[derive(Debug, Clone)]
pub struct InstallContext {
    pub id: String,
    pub install_dir: PathBuf,
    /// Files created or modified by tasks during this run.
    pub updated_files: Vec<PathBuf>,
}

impl InstallContext {
    pub fn new(id: impl Into<String>, install_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            install_dir: install_dir.into(),
            updated_files: Vec::new(),
        }
    }
}

/// A unit of post-unpack directory mutation.
pub trait InstallTask: Send + Sync {
    fn name(&self) -> &str;

    fn install(
        &self,
        ctx: &mut InstallContext,
        config: &ProcessConfig,
        id: &str,
        install_dir: &Path,
    ) -> Result<(), InstallError>;
}

/// Ordered list of install tasks.
#[derive(Default)]
pub struct InstallTaskPipeline {
    tasks: Vec<Box<dyn InstallTask>>,
}

impl InstallTaskPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard pipeline: remove unwanted paths, mark scripts executable,
    /// then write the process environment.
    pub fn post_unpack(remove_paths: Vec<String>) -> Self {
        Self::new()
            .with_task(RemoveFilesTask::new(remove_paths))
            .with_task(ChmodScriptsTask)
            .with_task(EnvironmentFileTask)
    }

    pub fn with_task(mut self, task: impl InstallTask + 'static) -> Self {
        self.tasks.push(Box::new(task));
        self
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.name()).collect()
    }

    /// Run every task in order, stopping at the first failure.
    pub fn run(
        &self,
        ctx: &mut InstallContext,
        config: &ProcessConfig,
        id: &str,
        install_dir: &Path,
    ) -> Result<(), InstallError> {
        for task in &self.tasks {
            debug!(id = %id, task = %task.name(), "Running install task");
            task.install(ctx, config, id, install_dir)
                .map_err(|e| InstallError::Task {
                    task: task.name().to_string(),
                    source: Box::new(e),
                })?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for InstallTaskPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.task_names()).finish()
    }
}

/// Resolve the real root of an unpacked archive.
///
/// Archives commonly wrap their content in a single top-level directory; when
/// `install_dir` holds exactly one entry and it is a directory, that directory
/// is the root.
pub fn find_install_dir(install_dir: &Path) -> Result<PathBuf, InstallError> {
    let mut entries = fs::read_dir(install_dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;

    if entries.len() == 1 && entries[0].is_dir() {
        return Ok(entries.remove(0));
    }
    Ok(install_dir.to_path_buf())
}

/// Removes files or directories from the distribution after unpacking.
#[derive(Debug, Clone)]
pub struct RemoveFilesTask {
    remove_paths: Vec<String>,
}

impl RemoveFilesTask {
    pub fn new(remove_paths: Vec<String>) -> Self {
        Self { remove_paths }
    }
}

impl InstallTask for RemoveFilesTask {
    fn name(&self) -> &str {
        "remove-files"
    }

    fn install(
        &self,
        _ctx: &mut InstallContext,
        _config: &ProcessConfig,
        id: &str,
        install_dir: &Path,
    ) -> Result<(), InstallError> {
        if self.remove_paths.is_empty() {
            return Ok(());
        }

        let base_dir = find_install_dir(install_dir)?;
        for remove_path in &self.remove_paths {
            let relative = Path::new(remove_path);
            if relative.is_absolute()
                || relative
                    .components()
                    .any(|c| matches!(c, Component::ParentDir))
            {
                return Err(InstallError::InvalidOptions(format!(
                    "removal path '{remove_path}' escapes the install directory"
                )));
            }
            let target = base_dir.join(relative);

            match fs::symlink_metadata(&target) {
                Ok(meta) => {
                    info!(id = %id, path = %target.display(), "Removing file");
                    if meta.is_dir() {
                        fs::remove_dir_all(&target)?;
                    } else {
                        fs::remove_file(&target)?;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(
                        id = %id,
                        remove_path = %remove_path,
                        path = %target.display(),
                        "Post unpack removal path does not exist"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Marks the launcher scripts under `bin/` executable.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChmodScriptsTask;

impl InstallTask for ChmodScriptsTask {
    fn name(&self) -> &str {
        "chmod-scripts"
    }

    fn install(
        &self,
        _ctx: &mut InstallContext,
        _config: &ProcessConfig,
        id: &str,
        install_dir: &Path,
    ) -> Result<(), InstallError> {
        let bin_dir = find_install_dir(install_dir)?.join("bin");
        if !bin_dir.is_dir() {
            debug!(id = %id, path = %bin_dir.display(), "No bin directory");
            return Ok(());
        }

        for entry in fs::read_dir(&bin_dir)? {
            let path = entry?.path();
            if path.is_file() {
                make_executable(&path)?;
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Writes the process environment as `KEY=VALUE` lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvironmentFileTask;

impl InstallTask for EnvironmentFileTask {
    fn name(&self) -> &str {
        "environment-file"
    }

    fn install(
        &self,
        ctx: &mut InstallContext,
        config: &ProcessConfig,
        id: &str,
        install_dir: &Path,
    ) -> Result<(), InstallError> {
        if config.environment.is_empty() {
            return Ok(());
        }

        let path = find_install_dir(install_dir)?.join(ENVIRONMENT_FILE);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let body: String = config
            .environment
            .iter()
            .map(|(k, v)| format!("{k}={v}\n"))
            .collect();
        fs::write(&path, body)?;

        debug!(
            id = %id,
            path = %path.display(),
            var_count = config.environment.len(),
            "Wrote process environment"
        );
        ctx.updated_files.push(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn run_task(task: &dyn InstallTask, dir: &Path) -> Result<InstallContext, InstallError> {
        let mut ctx = InstallContext::new("proc", dir);
        task.install(&mut ctx, &ProcessConfig::default(), "proc", dir)?;
        Ok(ctx)
    }

    #[test]
    fn test_remove_files_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("docs/api")).unwrap();
        fs::write(dir.path().join("README"), "x").unwrap();

        let task = RemoveFilesTask::new(vec!["docs".to_string(), "README".to_string()]);
        run_task(&task, dir.path()).unwrap();
        assert!(!dir.path().join("docs").exists());
        assert!(!dir.path().join("README").exists());

        run_task(&task, dir.path()).unwrap();
    }

    #[test]
    fn test_remove_files_rejects_escaping_path() {
        let dir = tempfile::tempdir().unwrap();
        for bad in ["/etc/passwd", "../sibling"] {
            let task = RemoveFilesTask::new(vec![bad.to_string()]);
            assert!(matches!(
                run_task(&task, dir.path()),
                Err(InstallError::InvalidOptions(_))
            ));
        }
    }

    #[test]
    fn test_find_install_dir_descends_single_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("web-1.0/bin")).unwrap();
        assert_eq!(
            find_install_dir(dir.path()).unwrap(),
            dir.path().join("web-1.0")
        );

        fs::write(dir.path().join("extra"), "x").unwrap();
        assert_eq!(find_install_dir(dir.path()).unwrap(), dir.path());
    }

    #[cfg(unix)]
    #[test]
    fn test_chmod_scripts() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        fs::write(dir.path().join("bin/launcher"), "#!/bin/sh\n").unwrap();
        fs::write(dir.path().join("lib.jar"), "x").unwrap();

        run_task(&ChmodScriptsTask, dir.path()).unwrap();
        let mode = fs::metadata(dir.path().join("bin/launcher"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o755, 0o755);
    }

    #[test]
    fn test_environment_file_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut environment = BTreeMap::new();
        environment.insert("PORT".to_string(), "8080".to_string());
        environment.insert("MODE".to_string(), "prod".to_string());
        let config = ProcessConfig {
            name: "web".to_string(),
            environment,
        };

        let mut ctx = InstallContext::new("web", dir.path());
        EnvironmentFileTask
            .install(&mut ctx, &config, "web", dir.path())
            .unwrap();

        let written = fs::read_to_string(dir.path().join(ENVIRONMENT_FILE)).unwrap();
        assert_eq!(written, "MODE=prod\nPORT=8080\n");
        assert_eq!(ctx.updated_files, vec![dir.path().join(ENVIRONMENT_FILE)]);
    }

    struct FailingTask;

    impl InstallTask for FailingTask {
        fn name(&self) -> &str {
            "failing"
        }

        fn install(
            &self,
            _ctx: &mut InstallContext,
            _config: &ProcessConfig,
            _id: &str,
            _install_dir: &Path,
        ) -> Result<(), InstallError> {
            Err(InstallError::Unpack("boom".to_string()))
        }
    }

    #[test]
    fn test_pipeline_aborts_on_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut environment = BTreeMap::new();
        environment.insert("A".to_string(), "1".to_string());
        let config = ProcessConfig {
            name: "web".to_string(),
            environment,
        };

        let pipeline = InstallTaskPipeline::new()
            .with_task(FailingTask)
            .with_task(EnvironmentFileTask);
        let mut ctx = InstallContext::new("web", dir.path());

        let err = pipeline
            .run(&mut ctx, &config, "web", dir.path())
            .unwrap_err();
        assert!(matches!(err, InstallError::Task { ref task, .. } if task == "failing"));
        assert!(!dir.path().join(ENVIRONMENT_FILE).exists());
    }

    #[test]
    fn test_post_unpack_order() {
        let pipeline = InstallTaskPipeline::post_unpack(vec![]);
        assert_eq!(
            pipeline.task_names(),
            vec!["remove-files", "chmod-scripts", "environment-file"]
        );
    }
}
