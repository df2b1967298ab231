/*
 * Copyright (C) 2025 The Stratus Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::env;
use std::error::Error;
use std::fs::OpenOptions;
use std::io::Write;
use std::process::{Command, Stdio};

use crate::stratus::k8s::pod::Pod;
use crate::stratus::util::{new_error, with_context};

/// Runtime-level description of one container, flattened from the pod spec.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub ports: Vec<u16>,
}

/// Snapshot of a container as the runtime reports it.
#[derive(Debug, Clone, Default)]
pub struct RuntimeContainerStatus {
    pub id: String,
    pub state: String,
    pub exit_code: i32,
    pub ip: String,
    pub image: String,
}

/// Seam between the pod manager and whatever actually runs containers. The
/// control plane never touches this; only the node agent drives it.
pub trait ContainerRuntime: Send + Sync {
    fn ping(&self) -> Result<(), Box<dyn Error + Send + Sync>>;
    fn pull_image(&self, image: &str) -> Result<(), Box<dyn Error + Send + Sync>>;
    fn create_container(&self, spec: &ContainerSpec) -> Result<String, Box<dyn Error + Send + Sync>>;
    fn start_container(&self, id: &str) -> Result<(), Box<dyn Error + Send + Sync>>;
    fn stop_container(&self, id: &str, timeout_secs: u32) -> Result<(), Box<dyn Error + Send + Sync>>;
    fn remove_container(&self, id: &str, force: bool) -> Result<(), Box<dyn Error + Send + Sync>>;
    fn container_status(
        &self,
        id: &str,
    ) -> Result<RuntimeContainerStatus, Box<dyn Error + Send + Sync>>;
}

/// Flatten a pod into per-container runtime specs. Container names are
/// prefixed with the pod UID so one runtime can host many pods.
pub fn pod_container_specs(pod: &Pod) -> Vec<ContainerSpec> {
    pod.spec
        .containers
        .iter()
        .map(|container| ContainerSpec {
            name: format!("{}-{}", pod.metadata.uid, container.name),
            image: container.image.clone(),
            env: container
                .env
                .iter()
                .map(|env| (env.name.clone(), env.value.clone()))
                .collect(),
            ports: container.ports.iter().map(|p| p.container_port).collect(),
        })
        .collect()
}

/// Driver shelling out to the `docker` CLI. Setting STRATUS_DOCKER_RECORD to
/// a file path records every invocation there instead of executing it, which
/// is how the tests observe the driver.
pub struct DockerRuntime {
    binary: String,
    record_path: Option<String>,
}

impl DockerRuntime {
    pub fn new() -> Self {
        DockerRuntime {
            binary: env::var("STRATUS_DOCKER").unwrap_or_else(|_| "docker".to_string()),
            record_path: env::var("STRATUS_DOCKER_RECORD").ok(),
        }
    }

    fn run(&self, args: &[String]) -> Result<String, Box<dyn Error + Send + Sync>> {
        if let Some(record_path) = self.record_path.as_ref() {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(record_path)
                .map_err(|e| with_context(e, "failed to open docker record log"))?;
            writeln!(file, "{} {}", self.binary, args.join(" "))
                .map_err(|e| with_context(e, "failed to write docker record"))?;
            return Ok(String::new());
        }

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| with_context(e, format!("failed to execute {}", self.binary)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(new_error(format!(
                "{} {} exited with status {:?}: {}",
                self.binary,
                args.join(" "),
                output.status.code(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime for DockerRuntime {
    fn ping(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.run(&["version".to_string(), "--format".to_string(), "{{.Server.Version}}".to_string()])?;
        Ok(())
    }

    fn pull_image(&self, image: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.run(&["pull".to_string(), image.to_string()])?;
        Ok(())
    }

    fn create_container(
        &self,
        spec: &ContainerSpec,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let mut args = vec!["create".to_string(), "--name".to_string(), spec.name.clone()];
        for (key, value) in &spec.env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        for port in &spec.ports {
            args.push("--publish".to_string());
            args.push(port.to_string());
        }
        args.push(spec.image.clone());

        let id = self.run(&args)?;
        if id.is_empty() {
            // Record mode produces no output; synthesize a stable id.
            return Ok(format!("cid-{}", spec.name));
        }
        Ok(id)
    }

    fn start_container(&self, id: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.run(&["start".to_string(), id.to_string()])?;
        Ok(())
    }

    fn stop_container(
        &self,
        id: &str,
        timeout_secs: u32,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.run(&[
            "stop".to_string(),
            "--time".to_string(),
            timeout_secs.to_string(),
            id.to_string(),
        ])?;
        Ok(())
    }

    fn remove_container(&self, id: &str, force: bool) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("--force".to_string());
        }
        args.push(id.to_string());
        self.run(&args)?;
        Ok(())
    }

    fn container_status(
        &self,
        id: &str,
    ) -> Result<RuntimeContainerStatus, Box<dyn Error + Send + Sync>> {
        let output = self.run(&[
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Status}} {{.State.ExitCode}} {{.NetworkSettings.IPAddress}} {{.Config.Image}}"
                .to_string(),
            id.to_string(),
        ])?;
        if output.is_empty() {
            // Record mode: pretend the container is running.
            return Ok(RuntimeContainerStatus {
                id: id.to_string(),
                state: "running".to_string(),
                ..Default::default()
            });
        }

        let mut fields = output.split_whitespace();
        let state = fields.next().unwrap_or("unknown").to_string();
        let exit_code = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
        let ip = fields.next().unwrap_or("").to_string();
        let image = fields.next().unwrap_or("").to_string();

        Ok(RuntimeContainerStatus {
            id: id.to_string(),
            state,
            exit_code,
            ip,
            image,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stratus::k8s::pod::{Container, ContainerPort, EnvVar, ObjectMeta, PodSpec};
    use serial_test::serial;

    #[test]
    fn pod_flattens_to_container_specs() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: "web-1".to_string(),
                uid: "uid-1".to_string(),
                ..Default::default()
            },
            spec: PodSpec {
                containers: vec![Container {
                    name: "web".to_string(),
                    image: "nginx:1.27".to_string(),
                    env: vec![EnvVar {
                        name: "MODE".to_string(),
                        value: "prod".to_string(),
                    }],
                    ports: vec![ContainerPort {
                        container_port: 8080,
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        };

        let specs = pod_container_specs(&pod);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "uid-1-web");
        assert_eq!(specs[0].env, vec![("MODE".to_string(), "prod".to_string())]);
        assert_eq!(specs[0].ports, vec![8080]);
    }

    #[test]
    #[serial]
    fn record_mode_logs_commands_instead_of_running_them() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("docker.log");
        env::set_var("STRATUS_DOCKER_RECORD", &log_path);
        env::set_var("STRATUS_DOCKER", "/usr/bin/docker");

        let runtime = DockerRuntime::new();
        runtime.pull_image("nginx:1.27").expect("pull");
        let id = runtime
            .create_container(&ContainerSpec {
                name: "uid-1-web".to_string(),
                image: "nginx:1.27".to_string(),
                env: vec![("MODE".to_string(), "prod".to_string())],
                ports: vec![8080],
            })
            .expect("create");
        assert_eq!(id, "cid-uid-1-web");
        runtime.start_container(&id).expect("start");

        let log = std::fs::read_to_string(&log_path).expect("read log");
        assert!(log.contains("pull nginx:1.27"));
        assert!(log.contains("--env MODE=prod"));
        assert!(log.contains("--publish 8080"));
        assert!(log.contains("start cid-uid-1-web"));

        env::remove_var("STRATUS_DOCKER_RECORD");
        env::remove_var("STRATUS_DOCKER");
    }
}
