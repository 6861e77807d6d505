//! The per-evaluation sandbox and its capability seams.
//!
//! A [`Sandbox`] is constructed for every code evaluation. It is a scoping
//! boundary for ergonomics and resource plumbing, not a security boundary:
//! it bundles the capabilities evaluated code may use (`console`, `fetch`,
//! `exec`, `env`, `require`, `emit`) together with the registered tools of
//! the path, and buffers console output and emitted events for the
//! processor to drain after the run.
//!
//! How code actually runs is pluggable through [`CodeEvaluator`]. An
//! embedded scripting runtime, a constrained DSL, or an out-of-process
//! worker all fit, as long as the evaluator honours the capability contract
//! and returns a JSON-serialisable value or an error message. Tests inject
//! scripted evaluators. Tool implementations route back through the same
//! evaluator via [`Sandbox::call_tool`], sharing the call's capability
//! context.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::sync::{Arc, Mutex};

use crate::agentstream::event::EventInput;

/// A tool registered for a path, callable from evaluated code.
///
/// `implementation` is the body of an asynchronous function of one
/// parameter `params` running against the same capability bag as the
/// calling block. Interpretation of the source is the evaluator's concern;
/// a broken implementation surfaces as an error at call time rather than
/// blocking the processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredTool {
    pub name: String,
    pub description: String,
    pub parameters_json_schema: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_description: Option<String>,
    pub implementation: String,
}

/// One captured console entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleEntry {
    pub level: String,
    pub args: Vec<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// Request shape for the `fetch` capability.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        FetchRequest {
            url: url.into(),
            method: "GET".to_string(),
            headers: HashMap::new(),
            body: None,
        }
    }
}

/// Response shape for the `fetch` capability.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl FetchResponse {
    /// Parse the body as JSON.
    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// Outbound HTTP. Tests inject mocks; the default implementation is
/// [`HttpFetcher`].
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: FetchRequest)
        -> Result<FetchResponse, Box<dyn Error + Send + Sync>>;
}

/// Default [`Fetcher`] backed by a shared reqwest client.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        HttpFetcher {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        HttpFetcher::new()
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        request: FetchRequest,
    ) -> Result<FetchResponse, Box<dyn Error + Send + Sync>> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())?;
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect();
        let body = response.text().await?;
        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }
}

/// Output of the `exec` capability.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Child-process execution. Tests inject mocks; the default implementation
/// is [`ShellRunner`].
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn exec(&self, command: &str) -> Result<ExecOutput, Box<dyn Error + Send + Sync>>;
}

/// Default [`CommandRunner`] invoking `/bin/bash -c`.
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn exec(&self, command: &str) -> Result<ExecOutput, Box<dyn Error + Send + Sync>> {
        let output = tokio::process::Command::new("/bin/bash")
            .arg("-c")
            .arg(command)
            .output()
            .await?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

/// Dynamic module import for evaluated code. Evaluators embedding a real
/// scripting runtime typically resolve modules themselves; the default
/// [`NoModules`] resolver reports the capability as unavailable.
#[async_trait]
pub trait ModuleResolver: Send + Sync {
    async fn require(
        &self,
        specifier: &str,
    ) -> Result<serde_json::Value, Box<dyn Error + Send + Sync>>;
}

pub struct NoModules;

#[async_trait]
impl ModuleResolver for NoModules {
    async fn require(
        &self,
        specifier: &str,
    ) -> Result<serde_json::Value, Box<dyn Error + Send + Sync>> {
        Err(format!("module resolution is not available (requested {:?})", specifier).into())
    }
}

/// The capability bag shared by every sandbox of one processor instance.
pub struct Capabilities {
    pub fetcher: Arc<dyn Fetcher>,
    pub runner: Arc<dyn CommandRunner>,
    pub modules: Arc<dyn ModuleResolver>,
    /// Read-only environment view handed to evaluated code.
    pub env: HashMap<String, String>,
}

impl Capabilities {
    /// Live defaults: real HTTP, a real shell, no module resolution, and a
    /// snapshot of the process environment.
    pub fn live() -> Self {
        Capabilities {
            fetcher: Arc::new(HttpFetcher::new()),
            runner: Arc::new(ShellRunner),
            modules: Arc::new(NoModules),
            env: std::env::vars().collect(),
        }
    }
}

/// Pluggable evaluation of codemode source.
#[async_trait]
pub trait CodeEvaluator: Send + Sync {
    /// Run a block (the body between the `<codemode>` markers) and return
    /// the value of its `codemode()` function, or an error message for a
    /// throw. The error never crosses into the processor runtime; it is
    /// recorded as a `code-eval-failed` or `deferred-failed` event.
    async fn evaluate_block(
        &self,
        code: &str,
        sandbox: &Sandbox,
    ) -> Result<serde_json::Value, String>;

    /// Run a registered tool's implementation with `params`, sharing the
    /// calling block's sandbox.
    async fn evaluate_tool(
        &self,
        implementation: &str,
        params: serde_json::Value,
        sandbox: &Sandbox,
    ) -> Result<serde_json::Value, Box<dyn Error + Send + Sync>>;
}

/// Per-call scoping boundary for one evaluation.
pub struct Sandbox {
    capabilities: Arc<Capabilities>,
    tools: BTreeMap<String, RegisteredTool>,
    evaluator: Arc<dyn CodeEvaluator>,
    console: Mutex<Vec<ConsoleEntry>>,
    emitted: Mutex<Vec<EventInput>>,
}

impl Sandbox {
    pub fn new(
        capabilities: Arc<Capabilities>,
        tools: BTreeMap<String, RegisteredTool>,
        evaluator: Arc<dyn CodeEvaluator>,
    ) -> Self {
        Sandbox {
            capabilities,
            tools,
            evaluator,
            console: Mutex::new(Vec::new()),
            emitted: Mutex::new(Vec::new()),
        }
    }

    /// Record one console entry (`log`, `error`, `warn`, `info`, `debug`).
    pub fn console(&self, level: &str, args: Vec<serde_json::Value>) {
        self.console
            .lock()
            .expect("acquire console buffer lock")
            .push(ConsoleEntry {
                level: level.to_string(),
                args,
                timestamp: Utc::now(),
            });
    }

    pub async fn fetch(
        &self,
        request: FetchRequest,
    ) -> Result<FetchResponse, Box<dyn Error + Send + Sync>> {
        self.capabilities.fetcher.fetch(request).await
    }

    pub async fn exec(&self, command: &str) -> Result<ExecOutput, Box<dyn Error + Send + Sync>> {
        self.capabilities.runner.exec(command).await
    }

    pub fn env(&self, key: &str) -> Option<&str> {
        self.capabilities.env.get(key).map(String::as_str)
    }

    pub async fn require(
        &self,
        specifier: &str,
    ) -> Result<serde_json::Value, Box<dyn Error + Send + Sync>> {
        self.capabilities.modules.require(specifier).await
    }

    /// Buffer an event for the processor to append once the evaluation
    /// completes. Emission is deferred by design: emitted events receive
    /// offsets strictly above the triggering `code-block-added`, and code
    /// that emits an event whose processing would re-enter the same
    /// evaluation path therefore terminates.
    pub fn emit(&self, event: EventInput) {
        self.emitted
            .lock()
            .expect("acquire emit buffer lock")
            .push(event);
    }

    /// Invoke a registered tool by name, routing its implementation
    /// through the evaluator with this sandbox's capabilities.
    pub async fn call_tool(
        &self,
        name: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, Box<dyn Error + Send + Sync>> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| format!("tool not registered: {}", name))?;
        self.evaluator
            .evaluate_tool(&tool.implementation, params, self)
            .await
    }

    pub fn tools(&self) -> &BTreeMap<String, RegisteredTool> {
        &self.tools
    }

    pub(crate) fn take_console(&self) -> Vec<ConsoleEntry> {
        std::mem::take(&mut self.console.lock().expect("acquire console buffer lock"))
    }

    pub(crate) fn take_emitted(&self) -> Vec<EventInput> {
        std::mem::take(&mut self.emitted.lock().expect("acquire emit buffer lock"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullEvaluator;

    #[async_trait]
    impl CodeEvaluator for NullEvaluator {
        async fn evaluate_block(
            &self,
            _code: &str,
            _sandbox: &Sandbox,
        ) -> Result<serde_json::Value, String> {
            Ok(serde_json::Value::Null)
        }

        async fn evaluate_tool(
            &self,
            implementation: &str,
            params: serde_json::Value,
            _sandbox: &Sandbox,
        ) -> Result<serde_json::Value, Box<dyn Error + Send + Sync>> {
            Ok(serde_json::json!({ "impl": implementation, "params": params }))
        }
    }

    fn sandbox(tools: BTreeMap<String, RegisteredTool>) -> Sandbox {
        let capabilities = Arc::new(Capabilities {
            fetcher: Arc::new(HttpFetcher::new()),
            runner: Arc::new(ShellRunner),
            modules: Arc::new(NoModules),
            env: HashMap::from([("HOME".to_string(), "/tmp".to_string())]),
        });
        Sandbox::new(capabilities, tools, Arc::new(NullEvaluator))
    }

    #[tokio::test]
    async fn test_console_and_emit_buffers_drain_once() {
        let sandbox = sandbox(BTreeMap::new());
        sandbox.console("log", vec![serde_json::json!("hello")]);
        sandbox.emit(EventInput::new("custom", serde_json::json!({})));

        assert_eq!(sandbox.take_console().len(), 1);
        assert_eq!(sandbox.take_console().len(), 0);
        assert_eq!(sandbox.take_emitted().len(), 1);
        assert_eq!(sandbox.take_emitted().len(), 0);
    }

    #[tokio::test]
    async fn test_env_is_read_only_view() {
        let sandbox = sandbox(BTreeMap::new());
        assert_eq!(sandbox.env("HOME"), Some("/tmp"));
        assert_eq!(sandbox.env("MISSING"), None);
    }

    #[tokio::test]
    async fn test_call_tool_routes_through_evaluator() {
        let mut tools = BTreeMap::new();
        tools.insert(
            "greet".to_string(),
            RegisteredTool {
                name: "greet".to_string(),
                description: "Greets".to_string(),
                parameters_json_schema: serde_json::json!({"type": "object"}),
                return_description: None,
                implementation: "return 'hi ' + params.name".to_string(),
            },
        );
        let sandbox = sandbox(tools);
        let result = sandbox
            .call_tool("greet", serde_json::json!({"name": "ada"}))
            .await
            .unwrap();
        assert_eq!(result["params"]["name"], "ada");

        let missing = sandbox.call_tool("absent", serde_json::json!({})).await;
        assert!(missing.is_err());
    }
}
