//! Out-of-process modules.
//!
//! A plugin is any executable script launched through the interpreter
//! configured for its extension. It talks newline-delimited JSON-RPC 2.0 over
//! stdin/stdout:
//!
//! - request `register` `{name}` -> `{developer?, version?, description?,
//!   commands: [{name, description?, usage?, owner_only?, admin_only?, aliases?}]}`
//! - request `invoke` `{command, args, text, account_id, chat_id, message_id,
//!   sender_id}` -> `{replies: [{text, html?}]}` (or `null`)
//! - notification `unregister` `{name}`; the process is killed right after.
//!
//! Answering `register` with `-32601` (method not found) means the plugin has
//! no entry point. Stderr lines are forwarded to the log.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command as ProcessCommand},
    sync::{oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

use crate::{
    commands::{Capability, Command, CommandContext, CommandHandler, CommandTable},
    host::Host,
    modules::{manifest::ModuleHeader, LoadError, Module, ModuleInfo},
    transport::TextFormat,
};

const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Serialize)]
struct RpcNotification<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    id: Value,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("plugin error {code}: {message}")]
    Remote { code: i64, message: String },
    #[error("plugin request timed out after {0:?}")]
    Timeout(Duration),
    #[error("plugin closed its output")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>>;

/// A running plugin process plus its JSON-RPC plumbing.
pub struct PluginProcess {
    module: String,
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    pending: Pending,
    next_id: AtomicU64,
    timeout: Duration,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl PluginProcess {
    pub async fn spawn(
        module: &str,
        interpreter: &str,
        script: &Path,
        timeout: Duration,
    ) -> Result<Arc<Self>, LoadError> {
        let mut child = ProcessCommand::new(interpreter)
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LoadError::Spawn(format!("{interpreter} {}: {e}", script.display())))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LoadError::Spawn("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LoadError::Spawn("failed to capture stdout".to_string()))?;
        let stderr = child.stderr.take();

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        let reader_pending = pending.clone();
        let reader_module = module.to_string();
        let stdout_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        debug!(module = %reader_module, "plugin stdout closed");
                        break;
                    }
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        trace!(module = %reader_module, raw = %trimmed, "plugin -> host");
                        match serde_json::from_str::<RpcResponse>(trimmed) {
                            Ok(resp) => {
                                let Some(id) = resp.id.as_u64() else {
                                    warn!(module = %reader_module, "plugin response without numeric id");
                                    continue;
                                };
                                if let Some(tx) = reader_pending.lock().await.remove(&id) {
                                    let _ = tx.send(resp);
                                } else {
                                    warn!(module = %reader_module, id, "response for unknown request id");
                                }
                            }
                            Err(e) => {
                                debug!(module = %reader_module, error = %e, "ignoring non-rpc plugin output");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(module = %reader_module, error = %e, "error reading plugin stdout");
                        break;
                    }
                }
            }
            // Fail every waiter still in flight.
            reader_pending.lock().await.clear();
        });

        let mut readers = vec![stdout_task];
        if let Some(stderr) = stderr {
            let stderr_module = module.to_string();
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(module = %stderr_module, "{line}");
                }
            }));
        }

        Ok(Arc::new(Self {
            module: module.to_string(),
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            timeout,
            readers: Mutex::new(readers),
        }))
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let req = RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        if let Err(e) = self.write_line(&serde_json::to_string(&req)?).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }
        trace!(module = %self.module, method, id, "host -> plugin");

        let resp = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(_)) => return Err(RpcError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(RpcError::Timeout(self.timeout));
            }
        };

        if let Some(err) = resp.error {
            return Err(RpcError::Remote {
                code: err.code,
                message: err.message,
            });
        }
        Ok(resp.result.unwrap_or(Value::Null))
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<(), RpcError> {
        let notif = RpcNotification {
            jsonrpc: "2.0",
            method,
            params,
        };
        self.write_line(&serde_json::to_string(&notif)?).await
    }

    async fn write_line(&self, payload: &str) -> Result<(), RpcError> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(payload.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    pub async fn kill(&self) {
        for handle in self.readers.lock().await.drain(..) {
            handle.abort();
        }
        let _ = self.child.lock().await.kill().await;
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RegisterReply {
    developer: Option<String>,
    version: Option<String>,
    description: Option<String>,
    commands: Vec<CommandDecl>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CommandDecl {
    name: String,
    description: String,
    usage: String,
    owner_only: bool,
    admin_only: bool,
    aliases: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InvokeReply {
    replies: Vec<Reply>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Reply {
    text: String,
    html: bool,
}

/// A module backed by a plugin process. The process starts in `register`.
pub struct PluginModule {
    script: PathBuf,
    interpreter: String,
    header: ModuleHeader,
    timeout: Duration,
    process: OnceLock<Arc<PluginProcess>>,
    info: OnceLock<ModuleInfo>,
}

impl PluginModule {
    pub fn new(
        script: PathBuf,
        interpreter: impl Into<String>,
        header: ModuleHeader,
        timeout: Duration,
    ) -> Self {
        Self {
            script,
            interpreter: interpreter.into(),
            header,
            timeout,
            process: OnceLock::new(),
            info: OnceLock::new(),
        }
    }

    fn header_info(&self) -> ModuleInfo {
        ModuleInfo::from_parts(
            self.header.developer.clone(),
            self.header.version.clone(),
            self.header.description.clone(),
        )
    }
}

#[async_trait]
impl Module for PluginModule {
    fn info(&self) -> ModuleInfo {
        self.info.get().cloned().unwrap_or_else(|| self.header_info())
    }

    async fn register(
        &self,
        _host: &Arc<Host>,
        table: &CommandTable,
        name: &str,
    ) -> Result<(), LoadError> {
        let process = PluginProcess::spawn(name, &self.interpreter, &self.script, self.timeout).await?;

        let reply = match process.request("register", json!({ "name": name })).await {
            Ok(v) => v,
            Err(RpcError::Remote { code, .. }) if code == METHOD_NOT_FOUND => {
                process.kill().await;
                return Err(LoadError::MissingEntryPoint);
            }
            Err(e) => {
                process.kill().await;
                return Err(LoadError::Protocol(e.to_string()));
            }
        };
        let reply: RegisterReply = match serde_json::from_value(reply) {
            Ok(r) => r,
            Err(e) => {
                process.kill().await;
                return Err(LoadError::Protocol(format!("invalid register reply: {e}")));
            }
        };

        for decl in &reply.commands {
            if decl.name.trim().is_empty() {
                continue;
            }
            let handler = PluginCommand {
                process: process.clone(),
                command: decl.name.to_lowercase(),
            };
            let mut command = Command::new(&decl.name, name, handler)
                .description(decl.description.clone())
                .usage(decl.usage.clone());
            if decl.owner_only {
                command = command.require(Capability::Owner);
            }
            if decl.admin_only {
                command = command.require(Capability::Admin);
            }
            table.register(command);
            for alias in &decl.aliases {
                table.register_alias(alias, &decl.name);
            }
        }

        let header = self.header_info();
        let _ = self.info.set(ModuleInfo::from_parts(
            reply.developer.or(Some(header.developer)),
            reply.version.or(Some(header.version)),
            reply.description.or(Some(header.description)),
        ));
        let _ = self.process.set(process);
        Ok(())
    }

    async fn unregister(
        &self,
        _host: &Arc<Host>,
        table: &CommandTable,
        name: &str,
    ) -> anyhow::Result<()> {
        table.unregister_module(name);
        if let Some(process) = self.process.get() {
            if let Err(e) = process.notify("unregister", json!({ "name": name })).await {
                debug!(module = %name, error = %e, "unregister notification not delivered");
            }
            process.kill().await;
        }
        Ok(())
    }
}

struct PluginCommand {
    process: Arc<PluginProcess>,
    command: String,
}

#[async_trait]
impl CommandHandler for PluginCommand {
    async fn call(&self, ctx: CommandContext) -> anyhow::Result<()> {
        let params = json!({
            "command": self.command,
            "args": ctx.args,
            "text": ctx.message.text,
            "account_id": ctx.account_id().0,
            "chat_id": ctx.message.chat_id.0,
            "message_id": ctx.message.message_id.0,
            "sender_id": ctx.message.sender_id.map(|u| u.0),
        });
        let result = self.process.request("invoke", params).await?;
        let reply: InvokeReply = if result.is_null() {
            InvokeReply::default()
        } else {
            serde_json::from_value(result)?
        };

        for r in reply.replies {
            if r.text.is_empty() {
                continue;
            }
            let format = if r.html {
                TextFormat::Html
            } else {
                TextFormat::Plain
            };
            ctx.session
                .transport()
                .send(ctx.message.chat_id, &r.text, format)
                .await?;
        }
        Ok(())
    }
}
