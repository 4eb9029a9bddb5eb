use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, SandboxError};
use crate::host::Host;
use crate::types::{ExecRequest, ExecResult, LaunchSpec};

#[derive(Debug, Clone)]
struct Resource {
    running: bool,
    exit_code: Option<i32>,
}

/// In-memory host. Resources run until `finish` or `stop` is called.
/// `exec` echoes the command, except `hang`, which never returns.
/// With `stop_delay` set, `stop` marks the resource exited and then waits
/// before returning, the way a real SIGTERM does.
#[derive(Default)]
pub(crate) struct FakeHost {
    resources: Mutex<HashMap<String, Resource>>,
    fail_launch: Mutex<HashSet<String>>,
    pub(crate) launched: Mutex<Vec<LaunchSpec>>,
    stop_delay: Mutex<Option<Duration>>,
}

impl FakeHost {
    pub(crate) fn finish(&self, resource: &str, code: i32) {
        if let Some(r) = self.resources.lock().unwrap().get_mut(resource) {
            r.running = false;
            r.exit_code = Some(code);
        }
    }

    pub(crate) fn slow_stop(&self, delay: Duration) {
        *self.stop_delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn fail_launch(&self, resource: &str) {
        self.fail_launch.lock().unwrap().insert(resource.to_string());
    }

    pub(crate) fn add_orphan(&self, resource: &str) {
        self.resources.lock().unwrap().insert(
            resource.to_string(),
            Resource {
                running: true,
                exit_code: None,
            },
        );
    }

    pub(crate) fn is_known(&self, resource: &str) -> bool {
        self.resources.lock().unwrap().contains_key(resource)
    }

    pub(crate) fn is_running_now(&self, resource: &str) -> bool {
        self.resources
            .lock()
            .unwrap()
            .get(resource)
            .is_some_and(|r| r.running)
    }
}

#[async_trait]
impl Host for FakeHost {
    fn name(&self) -> &str {
        "fake"
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<()> {
        if self.fail_launch.lock().unwrap().contains(&spec.resource) {
            return Err(SandboxError::Host("launch refused".into()));
        }
        self.launched.lock().unwrap().push(spec.clone());
        self.resources.lock().unwrap().insert(
            spec.resource.clone(),
            Resource {
                running: true,
                exit_code: None,
            },
        );
        Ok(())
    }

    async fn exec(&self, _resource: &str, _workspace: &Path, request: &ExecRequest<'_>) -> Result<ExecResult> {
        if request.cmd == "hang" {
            match request.timeout {
                Some(timeout) => {
                    tokio::time::sleep(timeout).await;
                    return Err(SandboxError::ExecTimeout(timeout));
                }
                None => std::future::pending::<()>().await,
            }
        }
        Ok(ExecResult {
            exit_code: 0,
            output: format!("ran: {}\n", request.cmd),
        })
    }

    async fn is_running(&self, resource: &str) -> Result<bool> {
        Ok(self.is_running_now(resource))
    }

    async fn exit_code(&self, resource: &str) -> Result<Option<i32>> {
        Ok(self
            .resources
            .lock()
            .unwrap()
            .get(resource)
            .and_then(|r| r.exit_code))
    }

    async fn stop(&self, resource: &str, _grace: Duration) -> Result<()> {
        if let Some(r) = self.resources.lock().unwrap().get_mut(resource)
            && r.running
        {
            r.running = false;
            r.exit_code = Some(143);
        }
        let delay = *self.stop_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn remove(&self, resource: &str) -> Result<()> {
        self.resources.lock().unwrap().remove(resource);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names: Vec<_> = self
            .resources
            .lock()
            .unwrap()
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }
}
