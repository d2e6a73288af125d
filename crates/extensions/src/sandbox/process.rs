//! OS-process sandbox host.
//!
//! Each context is a child process started from the configured launcher with
//! the entrypoint URL as its last argument. The child sees only the
//! configured environment, runs inside a per-origin storage directory, and
//! talks JSON lines: host messages on stdin, extension messages on stdout.
//! Every stdout line is stamped with the child's handle and origin by the
//! host, so the pipe itself pins identity.

use std::{
    collections::HashMap,
    path::PathBuf,
    process::Stdio,
    sync::{Arc, Mutex},
};

use {
    async_trait::async_trait,
    palisade_protocol::{ExtensionMessage, MAX_PAYLOAD_BYTES},
    tokio::{
        io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader},
        process::{Child, Command},
        sync::mpsc,
        task::JoinHandle,
    },
    tracing::{debug, trace, warn},
};

use super::{
    ContextHandle, ContextSpec, InboundEnvelope, IsolatedContext, SandboxCapability, SandboxHost,
};
use crate::error::{Context, Error, Result};

/// Capabilities a child process can actually honour.
const SUPPORTED: &[SandboxCapability] = &[SandboxCapability::Scripts, SandboxCapability::SameOrigin];

pub struct ProcessHost {
    launcher: Vec<String>,
    storage_dir: PathBuf,
    env: HashMap<String, String>,
    max_line_bytes: usize,
}

impl ProcessHost {
    pub fn new(launcher: Vec<String>, storage_dir: PathBuf, env: HashMap<String, String>) -> Self {
        Self {
            launcher,
            storage_dir,
            env,
            max_line_bytes: MAX_PAYLOAD_BYTES,
        }
    }

    /// Cap on a single stdout line. Longer lines are discarded without
    /// being buffered.
    #[must_use]
    pub fn with_max_line_bytes(mut self, limit: usize) -> Self {
        self.max_line_bytes = limit;
        self
    }

    pub fn from_config(cfg: &palisade_config::SandboxConfig) -> Self {
        let storage_dir = cfg
            .storage_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("palisade-storage"));
        Self::new(cfg.launcher.clone(), storage_dir, cfg.env.clone())
    }

    /// Directory backing same-origin storage for `origin`.
    pub fn origin_dir(&self, origin: &str) -> PathBuf {
        let name: String = origin
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        self.storage_dir.join(name)
    }
}

#[async_trait]
impl SandboxHost for ProcessHost {
    async fn create(&self, spec: ContextSpec) -> Result<Arc<dyn IsolatedContext>> {
        if let Some(cap) = spec.policy.capabilities().find(|c| !SUPPORTED.contains(c)) {
            return Err(Error::sandbox(format!(
                "process sandbox cannot grant {}",
                cap.attribute_token()
            )));
        }
        let Some((program, args)) = self.launcher.split_first() else {
            return Err(Error::sandbox("no sandbox launcher configured"));
        };

        let work_dir = self.origin_dir(&spec.origin);
        tokio::fs::create_dir_all(&work_dir)
            .await
            .with_context(|| format!("failed to create storage dir {}", work_dir.display()))?;

        let mut child = Command::new(program)
            .args(args)
            .arg(spec.entrypoint.as_str())
            .env_clear()
            .envs(&self.env)
            .env("PALISADE_EXTENSION_ID", &spec.extension_id)
            .env("PALISADE_ORIGIN", &spec.origin)
            .current_dir(&work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn sandbox launcher {program}"))?;

        let handle = ContextHandle::next();
        let stdin = child.stdin.take().context("sandbox child has no stdin")?;
        let stdout = child.stdout.take().context("sandbox child has no stdout")?;
        let stderr = child.stderr.take().context("sandbox child has no stderr")?;

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = writer_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err()
                    || stdin.write_all(b"\n").await.is_err()
                    || stdin.flush().await.is_err()
                {
                    break;
                }
            }
        });

        let channel = spec.channel.clone();
        let origin = spec.origin.clone();
        let extension_id = spec.extension_id.clone();
        let max_line_bytes = self.max_line_bytes;
        let reader = tokio::spawn(async move {
            let mut stdout = BufReader::new(stdout);
            loop {
                let line = match read_line_bounded(&mut stdout, max_line_bytes).await {
                    Ok(Some(Line::Complete(bytes))) => bytes,
                    Ok(Some(Line::Oversized(len))) => {
                        debug!(extension = %extension_id, len, "oversized line dropped");
                        continue;
                    },
                    Ok(None) => break,
                    Err(e) => {
                        debug!(extension = %extension_id, error = %e, "sandbox stdout read failed");
                        break;
                    },
                };
                // from_slice rejects invalid UTF-8 along with malformed JSON.
                match serde_json::from_slice(&line) {
                    Ok(data) => channel.post(InboundEnvelope {
                        source: handle,
                        origin: origin.clone(),
                        data,
                    }),
                    Err(e) => trace!(extension = %extension_id, error = %e, "undecodable stdout line dropped"),
                }
            }
            debug!(extension = %extension_id, "sandbox stdout closed");
        });

        let log_id = spec.extension_id.clone();
        let stderr_task = tokio::spawn(async move {
            let mut stderr = BufReader::new(stderr);
            while let Ok(Some(line)) = read_line_bounded(&mut stderr, max_line_bytes).await {
                if let Line::Complete(bytes) = line {
                    debug!(extension = %log_id, "{}", String::from_utf8_lossy(&bytes));
                }
            }
        });

        debug!(
            extension = %spec.extension_id,
            handle = %handle,
            dir = %work_dir.display(),
            "sandbox process started"
        );

        Ok(Arc::new(ProcessContext {
            handle,
            origin: spec.origin,
            writer: Mutex::new(Some(writer_tx)),
            child: tokio::sync::Mutex::new(Some(child)),
            tasks: Mutex::new(vec![writer, reader, stderr_task]),
        }))
    }
}

/// One newline-terminated frame read from a child's stdout.
#[derive(Debug, PartialEq)]
enum Line {
    Complete(Vec<u8>),
    /// Byte length of a line that exceeded the cap. Its contents were never kept.
    Oversized(usize),
}

/// Read up to the next `\n`, buffering at most `limit` bytes. Bytes past the
/// limit are consumed and discarded so the next call starts on a fresh line.
/// Returns `None` at EOF. A trailing `\r` is stripped.
async fn read_line_bounded<R>(reader: &mut R, limit: usize) -> std::io::Result<Option<Line>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let mut seen = 0usize;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if seen == 0 {
                return Ok(None);
            }
            break;
        }
        let newline = available.iter().position(|&b| b == b'\n');
        let chunk = &available[..newline.unwrap_or(available.len())];
        seen += chunk.len();
        if seen <= limit {
            buf.extend_from_slice(chunk);
        } else if !buf.is_empty() {
            buf = Vec::new();
        }
        let consumed = newline.map_or(available.len(), |i| i + 1);
        reader.consume(consumed);
        if newline.is_some() {
            break;
        }
    }
    if seen > limit {
        return Ok(Some(Line::Oversized(seen)));
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(Some(Line::Complete(buf)))
}

struct ProcessContext {
    handle: ContextHandle,
    origin: String,
    writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
    child: tokio::sync::Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[async_trait]
impl IsolatedContext for ProcessContext {
    fn handle(&self) -> ContextHandle {
        self.handle
    }

    fn origin(&self) -> &str {
        &self.origin
    }

    fn deliver(&self, message: &ExtensionMessage) -> Result<()> {
        let line = serde_json::to_string(message)?;
        let writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        match writer.as_ref() {
            Some(tx) if tx.send(line).is_ok() => Ok(()),
            _ => Err(Error::sandbox(format!("context {} is closed", self.handle))),
        }
    }

    async fn destroy(&self) {
        self.writer.lock().unwrap_or_else(|e| e.into_inner()).take();
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
        if let Some(mut child) = self.child.lock().await.take()
            && let Err(e) = child.kill().await
        {
            warn!(handle = %self.handle, error = %e, "failed to kill sandbox process");
        }
    }
}
