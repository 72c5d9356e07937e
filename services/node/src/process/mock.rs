//! Mock process manager for testing and development.
//!
//! Materializes a fake unpacked package on disk so the post-unpack pipeline
//! runs against a real directory, but never launches an OS process.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use super::{
    InstallContext, InstallError, InstallOptions, InstallTaskPipeline, Installation,
    ProcessController, ProcessStartError,
};

/// First pid handed out by the mock.
const FIRST_PID: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Normal,
    FailInstall,
    FailStart,
    NoPid,
}

/// Mock process manager.
pub struct MockProcessManager {
    base_dir: PathBuf,
    behavior: Behavior,
    next_pid: Arc<AtomicU32>,
    installs: AtomicUsize,
    controllers: Mutex<Vec<Arc<MockController>>>,
}

impl MockProcessManager {
    /// Create a mock that installs under `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self::with_behavior(base_dir, Behavior::Normal)
    }

    /// A mock whose installs always fail.
    pub fn failing_install(base_dir: impl Into<PathBuf>) -> Self {
        Self::with_behavior(base_dir, Behavior::FailInstall)
    }

    /// A mock whose controllers fail to start.
    pub fn failing_start(base_dir: impl Into<PathBuf>) -> Self {
        Self::with_behavior(base_dir, Behavior::FailStart)
    }

    /// A mock whose controllers start but never report a pid.
    pub fn without_pid(base_dir: impl Into<PathBuf>) -> Self {
        Self::with_behavior(base_dir, Behavior::NoPid)
    }

    fn with_behavior(base_dir: impl Into<PathBuf>, behavior: Behavior) -> Self {
        Self {
            base_dir: base_dir.into(),
            behavior,
            next_pid: Arc::new(AtomicU32::new(FIRST_PID)),
            installs: AtomicUsize::new(0),
            controllers: Mutex::new(Vec::new()),
        }
    }

    /// Number of completed installs.
    pub fn install_count(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    /// Most recent controller handed out for an install id.
    pub fn controller(&self, id: &str) -> Option<Arc<MockController>> {
        let controllers = self.controllers.lock().ok()?;
        controllers.iter().rev().find(|c| c.id == id).cloned()
    }

    /// Directory an install with this id lands in.
    pub fn install_dir(&self, id: &str) -> PathBuf {
        self.base_dir.join("installs").join(id)
    }

    fn unpack(&self, options: &InstallOptions, install_dir: &Path) -> Result<(), InstallError> {
        let root = install_dir.join(format!(
            "{}-{}",
            options.coordinate.artifact_id, options.coordinate.version
        ));
        fs::create_dir_all(root.join("bin"))?;
        fs::write(root.join("bin/launcher"), "#!/bin/sh\nexec true\n")?;
        fs::write(root.join("package.txt"), options.coordinate.to_string())?;
        Ok(())
    }
}

impl super::ProcessManager for MockProcessManager {
    fn install(
        &self,
        options: &InstallOptions,
        post_unpack: &InstallTaskPipeline,
    ) -> Result<Installation, InstallError> {
        options.validate()?;

        if self.behavior == Behavior::FailInstall {
            return Err(InstallError::Unpack(format!(
                "[MOCK] install of {} configured to fail",
                options.coordinate
            )));
        }

        info!(
            id = %options.id,
            coordinate = %options.coordinate,
            "[MOCK] Installing package"
        );

        let install_dir = self.install_dir(&options.id);
        self.unpack(options, &install_dir)?;

        let mut ctx = InstallContext::new(options.id.clone(), install_dir.clone());
        post_unpack.run(&mut ctx, &options.process_config(), &options.id, &install_dir)?;

        self.installs.fetch_add(1, Ordering::SeqCst);
        debug!(
            id = %options.id,
            install_dir = %install_dir.display(),
            updated_files = ctx.updated_files.len(),
            "[MOCK] Package installed"
        );

        let controller = Arc::new(MockController {
            id: options.id.clone(),
            behavior: self.behavior,
            next_pid: Arc::clone(&self.next_pid),
            pid: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
        });
        if let Ok(mut controllers) = self.controllers.lock() {
            controllers.push(Arc::clone(&controller));
        }

        Ok(Installation {
            install_dir,
            controller,
        })
    }
}

/// Controller returned by the mock; tracks a fake pid.
pub struct MockController {
    id: String,
    behavior: Behavior,
    next_pid: Arc<AtomicU32>,
    /// Zero while not running.
    pid: AtomicU32,
    stopped: AtomicBool,
}

impl MockController {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Simulate the process dying on its own.
    pub fn kill(&self) {
        self.pid.store(0, Ordering::SeqCst);
    }
}

impl ProcessController for MockController {
    fn start(&self) -> Result<(), ProcessStartError> {
        match self.behavior {
            Behavior::FailStart => Err(ProcessStartError::Start {
                id: self.id.clone(),
                reason: "[MOCK] start configured to fail".to_string(),
            }),
            Behavior::NoPid => Ok(()),
            Behavior::Normal | Behavior::FailInstall => {
                let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
                self.pid.store(pid, Ordering::SeqCst);
                self.stopped.store(false, Ordering::SeqCst);
                info!(id = %self.id, pid, "[MOCK] Process started");
                Ok(())
            }
        }
    }

    fn stop(&self) -> Result<(), ProcessStartError> {
        info!(id = %self.id, "[MOCK] Stopping process");
        self.pid.store(0, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn pid(&self) -> Result<Option<u32>, ProcessStartError> {
        let pid = self.pid.load(Ordering::SeqCst);
        Ok((pid > 0).then_some(pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{DefaultImageResolver, ImageResolver};
    use crate::process::{ProcessManager, ENVIRONMENT_FILE};

    fn options(id: &str) -> InstallOptions {
        let coordinate = DefaultImageResolver::default()
            .resolve("acme/web:1.0")
            .unwrap();
        let mut options = InstallOptions::for_container(id, coordinate);
        options
            .environment
            .insert("PORT".to_string(), "8080".to_string());
        options
    }

    #[test]
    fn test_mock_install_runs_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let manager = MockProcessManager::new(dir.path());

        let installation = manager
            .install(&options("web"), &InstallTaskPipeline::post_unpack(vec![]))
            .unwrap();
        assert_eq!(installation.install_dir, manager.install_dir("web"));
        assert!(installation
            .install_dir
            .join("web-1.0")
            .join(ENVIRONMENT_FILE)
            .exists());
        assert_eq!(manager.install_count(), 1);
    }

    #[test]
    fn test_mock_reinstall_over_cleaned_dir() {
        let dir = tempfile::tempdir().unwrap();
        let manager = MockProcessManager::new(dir.path());
        let pipeline = InstallTaskPipeline::post_unpack(vec!["package.txt".to_string()]);

        manager.install(&options("web"), &pipeline).unwrap();
        manager.install(&options("web"), &pipeline).unwrap();
        assert_eq!(manager.install_count(), 2);
    }

    #[test]
    fn test_mock_controller_pids() {
        let dir = tempfile::tempdir().unwrap();
        let manager = MockProcessManager::new(dir.path());
        let pipeline = InstallTaskPipeline::new();

        let a = manager.install(&options("a"), &pipeline).unwrap();
        let b = manager.install(&options("b"), &pipeline).unwrap();
        assert_eq!(a.controller.pid().unwrap(), None);

        a.controller.start().unwrap();
        b.controller.start().unwrap();
        assert_eq!(a.controller.pid().unwrap(), Some(FIRST_PID));
        assert_eq!(b.controller.pid().unwrap(), Some(FIRST_PID + 1));

        a.controller.stop().unwrap();
        assert_eq!(a.controller.pid().unwrap(), None);
        assert!(manager.controller("a").unwrap().is_stopped());
        assert!(!manager.controller("b").unwrap().is_stopped());
    }

    #[test]
    fn test_mock_failing_variants() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = InstallTaskPipeline::new();

        let manager = MockProcessManager::failing_install(dir.path());
        assert!(manager.install(&options("web"), &pipeline).is_err());

        let manager = MockProcessManager::failing_start(dir.path());
        let installation = manager.install(&options("web"), &pipeline).unwrap();
        assert!(installation.controller.start().is_err());

        let manager = MockProcessManager::without_pid(dir.path());
        let installation = manager.install(&options("web"), &pipeline).unwrap();
        installation.controller.start().unwrap();
        assert_eq!(installation.controller.pid().unwrap(), None);
    }
}
