//! Core of every wrapped backend
//!
//! A [`SubprocessServer`] owns one backend process bound to a loopback port.
//! It knows how to launch the process and wait for it to answer its
//! readiness probe, and how to relay unary, streaming and multipart
//! requests to it. Adapters in [`crate::backend`] only decide which binary
//! to run, with which arguments, and how requests are rewritten.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use futures_util::TryStreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{OrchestratorConfig, ReadinessPolicy};
use crate::constants::{hosts, timeouts};
use crate::error::{BackendError, Result};
use crate::process::{LaunchOptions, ProcessHandle, ProcessSupervisor};
use crate::types::{MultipartField, ServerStatus};

/// Receives the raw bytes of a streamed response
pub type ByteSink = mpsc::Sender<Bytes>;

/// Lifecycle of a wrapped backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Unloaded,
    Starting,
    AwaitingReady,
    Loaded,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unloaded => "unloaded",
            Self::Starting => "starting",
            Self::AwaitingReady => "awaiting_ready",
            Self::Loaded => "loaded",
        };
        f.write_str(s)
    }
}

/// Everything needed to start one backend process
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub options: LaunchOptions,
    /// Path polled until it answers 2xx
    pub probe_path: &'static str,
}

pub struct SubprocessServer {
    name: String,
    port: u16,
    process: Option<ProcessHandle>,
    state: ServerState,
    readiness: ReadinessPolicy,
    request_timeout: Duration,
    debug: bool,
    http: reqwest::Client,
}

impl SubprocessServer {
    pub fn new(name: impl Into<String>, config: &OrchestratorConfig) -> Self {
        Self {
            name: name.into(),
            port: 0,
            process: None,
            state: ServerState::Unloaded,
            readiness: config.readiness.clone(),
            request_timeout: config.request_timeout(),
            debug: config.debug,
            http: reqwest::Client::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn is_loaded(&self) -> bool {
        self.state == ServerState::Loaded
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(ProcessHandle::pid)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", hosts::LOCAL, self.port)
    }

    pub fn set_readiness(&mut self, readiness: ReadinessPolicy) {
        self.readiness = readiness;
    }

    /// Pick a free loopback port for the next launch
    pub fn choose_port(&mut self) -> Result<u16> {
        let listener = std::net::TcpListener::bind((hosts::LOCAL, 0))?;
        self.port = listener.local_addr()?.port();
        log::debug!("{} will listen on port {}", self.name, self.port);
        Ok(self.port)
    }

    /// Use a specific port for the next launch
    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    /// Start the backend process and wait until it answers its probe.
    ///
    /// A previously launched process is stopped first. On failure the new
    /// process is stopped and the server is left unloaded.
    pub async fn launch(&mut self, spec: LaunchSpec) -> Result<()> {
        if self.process.is_some() {
            log::info!("{} already has a process, stopping it first", self.name);
            self.stop_process_blocking().await;
        }
        if self.port == 0 {
            self.choose_port()?;
        }

        self.state = ServerState::Starting;
        match self.start_and_wait(spec).await {
            Ok(()) => {
                self.state = ServerState::Loaded;
                log::info!("{} is ready at {}", self.name, self.base_url());
                Ok(())
            }
            Err(e) => {
                log::error!("{} failed to start: {}", self.name, e);
                self.stop_process_blocking().await;
                self.state = ServerState::Unloaded;
                self.port = 0;
                Err(e)
            }
        }
    }

    async fn start_and_wait(&mut self, spec: LaunchSpec) -> Result<()> {
        let handle = ProcessSupervisor::start(&self.name, &spec.executable, &spec.args, &spec.options)?;
        self.process = Some(handle);

        self.state = ServerState::AwaitingReady;
        self.wait_for_ready(spec.probe_path, self.readiness.max_retries)
            .await
    }

    /// Poll `probe_path` until it answers 2xx or the retries run out
    pub async fn wait_for_ready(&self, probe_path: &str, max_retries: u32) -> Result<()> {
        let url = format!("{}{}", self.base_url(), probe_path);
        log::debug!("Waiting for {} at {}", self.name, url);

        for attempt in 1..=max_retries {
            if let Some(process) = &self.process {
                if !process.is_running() {
                    return Err(BackendError::ProcessSpawn(format!(
                        "{} exited during startup (exit code: {:?})",
                        self.name,
                        process.exit_code()
                    )));
                }
            }

            match self
                .http
                .get(&url)
                .timeout(Duration::from_millis(timeouts::PROBE_MS))
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    log::trace!("{} probe returned {} (attempt {})", self.name, resp.status(), attempt)
                }
                Err(e) => log::trace!("{} probe failed: {} (attempt {})", self.name, e, attempt),
            }

            tokio::time::sleep(self.readiness.interval()).await;
        }

        Err(BackendError::BackendNotReady {
            backend: self.name.clone(),
            port: self.port,
        })
    }

    fn ensure_loaded(&self) -> Result<()> {
        if self.is_loaded() {
            Ok(())
        } else {
            Err(BackendError::ModelNotLoaded(self.name.clone()))
        }
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(BackendError::Upstream {
            status: status.as_u16(),
            body,
        })
    }

    /// POST a JSON request and return the backend's JSON response
    pub async fn forward_request(
        &self,
        endpoint: &str,
        request: &serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value> {
        self.ensure_loaded()?;
        let url = format!("{}{}", self.base_url(), endpoint);

        let resp = self
            .http
            .post(&url)
            .json(request)
            .timeout(timeout.unwrap_or(self.request_timeout))
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;

        Ok(resp.json().await?)
    }

    /// POST a JSON request and relay the response body into `sink` as it
    /// arrives.
    ///
    /// Stops early with [`BackendError::Cancelled`] when `cancel` fires or
    /// the receiving side of `sink` goes away.
    pub async fn forward_streaming_request(
        &self,
        endpoint: &str,
        request: &serde_json::Value,
        sink: &ByteSink,
        sse: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.ensure_loaded()?;
        let url = format!("{}{}", self.base_url(), endpoint);
        let accept = if sse { "text/event-stream" } else { "*/*" };

        let send = async {
            let resp = self
                .http
                .post(&url)
                .header(reqwest::header::ACCEPT, accept)
                .json(request)
                .send()
                .await?;
            Self::check_status(resp).await
        };

        // The backend may sit on the request before sending headers
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::debug!("{} request cancelled before response", self.name);
                return Err(BackendError::Cancelled);
            }
            _ = sink.closed() => {
                log::debug!("{} stream receiver dropped before response", self.name);
                return Err(BackendError::Cancelled);
            }
            resp = send => resp?,
        };

        let mut stream = resp.bytes_stream();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::debug!("{} stream cancelled", self.name);
                    return Err(BackendError::Cancelled);
                }
                _ = sink.closed() => {
                    log::debug!("{} stream receiver dropped", self.name);
                    return Err(BackendError::Cancelled);
                }
                chunk = stream.try_next() => match chunk? {
                    Some(bytes) => {
                        if sink.send(bytes).await.is_err() {
                            return Err(BackendError::Cancelled);
                        }
                    }
                    None => break,
                }
            }
        }

        Ok(())
    }

    /// POST a multipart/form-data request and return the JSON response
    pub async fn forward_multipart_request(
        &self,
        endpoint: &str,
        fields: Vec<MultipartField>,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value> {
        self.ensure_loaded()?;
        let url = format!("{}{}", self.base_url(), endpoint);

        let mut form = reqwest::multipart::Form::new();
        for field in fields {
            form = match field.filename {
                Some(filename) => {
                    let mut part = reqwest::multipart::Part::bytes(field.data).file_name(filename);
                    if let Some(content_type) = &field.content_type {
                        part = part.mime_str(content_type)?;
                    }
                    form.part(field.name, part)
                }
                None => form.text(field.name, String::from_utf8_lossy(&field.data).into_owned()),
            };
        }

        let resp = self
            .http
            .post(&url)
            .multipart(form)
            .timeout(timeout.unwrap_or(self.request_timeout))
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;

        Ok(resp.json().await?)
    }

    fn stop_process(&mut self) {
        if let Some(process) = self.process.take() {
            process.stop();
        }
    }

    /// Like `stop_process`, but the grace period runs on the blocking pool
    async fn stop_process_blocking(&mut self) {
        if let Some(process) = self.process.take() {
            let name = self.name.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || process.stop()).await {
                log::warn!("Stopping {} failed: {}", name, e);
            }
        }
    }

    /// Stop the process, if any. Safe to call repeatedly.
    pub fn unload(&mut self) {
        if self.state != ServerState::Unloaded || self.process.is_some() {
            log::info!("Unloading {}", self.name);
        }
        self.stop_process();
        self.state = ServerState::Unloaded;
        self.port = 0;
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            name: self.name.clone(),
            state: self.state.to_string(),
            ready: self.is_loaded(),
            url: self.is_loaded().then(|| self.base_url()),
            pid: self.pid(),
        }
    }

    /// Treat an already running server on `port` as loaded
    #[cfg(test)]
    pub(crate) fn attach_for_test(&mut self, port: u16) {
        self.port = port;
        self.state = ServerState::Loaded;
    }
}

impl Drop for SubprocessServer {
    fn drop(&mut self) {
        self.stop_process();
    }
}
