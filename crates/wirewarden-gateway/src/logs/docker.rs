//! Docker collaborator for C9's `docker` channel and C8's `docker_logs`
//! on-demand stream. Grounded on [`wirewarden_kernel::nft::NftRunner`]'s
//! subprocess-wrapper shape: shell out to the `docker` binary rather than
//! speak to its API directly (spec §5 lists subprocess invocations as a
//! first-class suspension point alongside `nft`/`wg`/`ip`).

use std::process::Stdio;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use crate::hub::pump::DockerLogSource;
use crate::status::{ContainerInfo, DockerListProvider};

#[derive(Debug, serde::Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "State")]
    state: String,
    #[serde(rename = "Status")]
    status: String,
}

pub struct DockerRunner {
    binary: String,
}

impl Default for DockerRunner {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerRunner {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }
}

impl DockerListProvider for DockerRunner {
    fn list(&self) -> BoxFuture<'_, Vec<ContainerInfo>> {
        Box::pin(async move {
            let output = tokio::process::Command::new(&self.binary)
                .args(["ps", "--all", "--format", "{{json .}}"])
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .await;

            let output = match output {
                Ok(output) if output.status.success() => output,
                Ok(output) => {
                    warn!(stderr = %String::from_utf8_lossy(&output.stderr), "docker ps failed");
                    return Vec::new();
                }
                Err(err) => {
                    warn!(error = %err, "failed to invoke docker ps");
                    return Vec::new();
                }
            };

            String::from_utf8_lossy(&output.stdout)
                .lines()
                .filter_map(|line| serde_json::from_str::<PsLine>(line).ok())
                .map(|line| ContainerInfo {
                    id: line.id,
                    name: line.names,
                    state: line.state,
                    status: line.status,
                })
                .collect()
        })
    }
}

impl DockerLogSource for DockerRunner {
    fn stream_logs(&self, container: &str) -> BoxFuture<'_, Result<BoxStream<'static, Vec<u8>>, String>> {
        let container = container.to_string();
        Box::pin(async move {
            let mut child = tokio::process::Command::new(&self.binary)
                .args(["logs", "-f", "--tail", "0", &container])
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .map_err(|err| err.to_string())?;

            let stdout = child.stdout.take().ok_or("docker logs produced no stdout handle")?;
            let reader = BufReader::new(stdout);

            // `unfold` carries `(reader, child)` as its state, so the child
            // process (and its `kill_on_drop`) lives exactly as long as the
            // stream does; dropping the stream kills the `docker logs`
            // subprocess the same way cancelling a log stream closes the
            // underlying response body (spec §4.8 "log streaming").
            let stream = stream::unfold((reader, child), |(mut reader, child)| async move {
                let mut line = String::new();
                match reader.read_line(&mut line).await {
                    Ok(0) => None,
                    Ok(_) => {
                        if line.ends_with('\n') {
                            line.pop();
                        }
                        Some((line.into_bytes(), (reader, child)))
                    }
                    Err(_) => None,
                }
            });

            Ok(Box::pin(stream) as BoxStream<'static, Vec<u8>>)
        })
    }
}
