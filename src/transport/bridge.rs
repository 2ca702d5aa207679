//! Transport backed by an external bridge process.
//!
//! Each client owns one child process started with
//! `--identity <id> --session-path <dir> --debug-port <port>`. The child
//! automates the real messaging connection and talks newline-delimited JSON:
//!
//! ```text
//! child -> gateway  {"type":"event","event":"qr","data":"2@abc..."}
//! child -> gateway  {"type":"response","id":7,"ok":true,"result":"CONNECTED"}
//! gateway -> child  {"id":7,"command":"get_state","params":{}}
//! ```

use super::traits::{
    AccountInfo, OutgoingPayload, RawMessage, TransportClient, TransportEvent, TransportFactory,
    TransportHandle, TransportSpec,
};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const EVENT_BUFFER: usize = 256;
const DESTROY_GRACE: Duration = Duration::from_secs(5);

/// One line written by the bridge child.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeLine {
    Event {
        event: String,
        #[serde(default)]
        data: Value,
    },
    Response {
        id: u64,
        ok: bool,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<String>,
    },
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

struct BridgeProcess {
    child: Child,
    stdin: ChildStdin,
    reader: JoinHandle<()>,
}

pub struct BridgeFactory {
    command: String,
    args: Vec<String>,
    command_timeout: Duration,
}

impl BridgeFactory {
    pub fn new(command: String, args: Vec<String>, command_timeout: Duration) -> Self {
        Self {
            command,
            args,
            command_timeout,
        }
    }
}

impl TransportFactory for BridgeFactory {
    fn name(&self) -> &str {
        "bridge"
    }

    fn create(&self, spec: &TransportSpec) -> Result<TransportHandle> {
        if self.command.trim().is_empty() {
            bail!("bridge transport command is empty");
        }
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let client = BridgeClient {
            spec: spec.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            command_timeout: self.command_timeout,
            events: tx,
            process: tokio::sync::Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            info: Arc::new(Mutex::new(None)),
            closing: Arc::new(AtomicBool::new(false)),
        };
        Ok(TransportHandle {
            client: Arc::new(client),
            events: rx,
        })
    }
}

struct BridgeClient {
    spec: TransportSpec,
    command: String,
    args: Vec<String>,
    command_timeout: Duration,
    events: mpsc::Sender<TransportEvent>,
    process: tokio::sync::Mutex<Option<BridgeProcess>>,
    pending: PendingMap,
    next_id: AtomicU64,
    info: Arc<Mutex<Option<AccountInfo>>>,
    closing: Arc<AtomicBool>,
}

impl BridgeClient {
    async fn spawn_process(&self) -> Result<BridgeProcess> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .arg("--identity")
            .arg(&self.spec.identity)
            .arg("--session-path")
            .arg(&self.spec.session_path)
            .arg("--debug-port")
            .arg(self.spec.debug_port.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn bridge `{}`", self.command))?;
        let stdin = child
            .stdin
            .take()
            .context("bridge stdin was not captured")?;
        let stdout = child
            .stdout
            .take()
            .context("bridge stdout was not captured")?;

        let identity = self.spec.identity.clone();
        let events = self.events.clone();
        let pending = self.pending.clone();
        let info = self.info.clone();
        let closing = self.closing.clone();

        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        dispatch_line(&identity, &line, &events, &pending, &info).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("Bridge {identity}: stdout read failed: {e}");
                        break;
                    }
                }
            }

            for (_, waiter) in pending.lock().drain() {
                let _ = waiter.send(Err(anyhow!("bridge process exited")));
            }
            if !closing.load(Ordering::SeqCst) {
                let _ = events
                    .send(TransportEvent::Disconnected("bridge exited".into()))
                    .await;
            }
        });

        tracing::info!(
            "Bridge {}: spawned `{}` (session: {}, debug port: {})",
            self.spec.identity,
            self.command,
            self.spec.session_path.display(),
            self.spec.debug_port
        );

        Ok(BridgeProcess {
            child,
            stdin,
            reader,
        })
    }

    async fn request(&self, command: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let mut line = json!({ "id": id, "command": command, "params": params }).to_string();
        line.push('\n');

        let write_result = {
            let mut guard = self.process.lock().await;
            match guard.as_mut() {
                Some(process) => {
                    let written = match process.stdin.write_all(line.as_bytes()).await {
                        Ok(()) => process.stdin.flush().await,
                        Err(e) => Err(e),
                    };
                    written.map_err(|e| anyhow!("bridge stdin write failed: {e}"))
                }
                None => Err(anyhow!("bridge process is not running")),
            }
        };
        if let Err(e) = write_result {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => bail!("bridge dropped `{command}` response"),
            Err(_) => {
                self.pending.lock().remove(&id);
                bail!(
                    "bridge `{command}` timed out after {}s",
                    self.command_timeout.as_secs()
                )
            }
        }
    }
}

async fn dispatch_line(
    identity: &str,
    line: &str,
    events: &mpsc::Sender<TransportEvent>,
    pending: &PendingMap,
    info: &Arc<Mutex<Option<AccountInfo>>>,
) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }
    let parsed: BridgeLine = match serde_json::from_str(trimmed) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!("Bridge {identity}: ignoring non-protocol line ({e}): {trimmed}");
            return;
        }
    };

    match parsed {
        BridgeLine::Response {
            id,
            ok,
            result,
            error,
        } => {
            let waiter = pending.lock().remove(&id);
            if let Some(waiter) = waiter {
                let outcome = if ok {
                    Ok(result)
                } else {
                    Err(anyhow!(error.unwrap_or_else(|| "bridge command failed".into())))
                };
                let _ = waiter.send(outcome);
            }
        }
        BridgeLine::Event { event, data } => {
            if event == "ready" {
                if let Ok(account) = serde_json::from_value::<AccountInfo>(data.clone()) {
                    *info.lock() = Some(account);
                }
            }
            match parse_event(&event, data) {
                Some(event) => {
                    if events.send(event).await.is_err() {
                        tracing::debug!("Bridge {identity}: event receiver closed");
                    }
                }
                None => tracing::debug!("Bridge {identity}: ignoring event `{event}`"),
            }
        }
    }
}

/// Map a bridge event name and payload to a transport event.
fn parse_event(name: &str, data: Value) -> Option<TransportEvent> {
    match name {
        "qr" => data.as_str().map(|code| TransportEvent::Qr(code.to_string())),
        "authenticated" => Some(TransportEvent::Authenticated),
        "ready" => Some(TransportEvent::Ready),
        "disconnected" => Some(TransportEvent::Disconnected(
            data.as_str().unwrap_or("unknown").to_string(),
        )),
        "loading_screen" | "loading_progress" => {
            let percent = data.get("percent").and_then(Value::as_u64).unwrap_or(0);
            let message = data
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Some(TransportEvent::LoadingProgress {
                percent: u8::try_from(percent.min(100)).unwrap_or(100),
                message,
            })
        }
        "message" => serde_json::from_value::<RawMessage>(data)
            .ok()
            .map(TransportEvent::Message),
        _ => None,
    }
}

#[async_trait]
impl TransportClient for BridgeClient {
    async fn initialize(&self) -> Result<()> {
        {
            let mut guard = self.process.lock().await;
            let running = match guard.as_mut() {
                Some(process) => matches!(process.child.try_wait(), Ok(None)),
                None => false,
            };
            if !running {
                self.closing.store(false, Ordering::SeqCst);
                *guard = Some(self.spawn_process().await?);
            }
        }
        self.request("initialize", json!({})).await.map(|_| ())
    }

    async fn logout(&self) -> Result<()> {
        self.request("logout", json!({})).await.map(|_| ())
    }

    async fn destroy(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        if let Err(e) = self.request("destroy", json!({})).await {
            tracing::debug!("Bridge {}: destroy command failed: {e}", self.spec.identity);
        }

        let process = self.process.lock().await.take();
        let Some(mut process) = process else {
            return Ok(());
        };
        drop(process.stdin);
        match tokio::time::timeout(DESTROY_GRACE, process.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                tracing::warn!(
                    "Bridge {}: process did not exit, killing",
                    self.spec.identity
                );
                process
                    .child
                    .kill()
                    .await
                    .context("Failed to kill bridge process")?;
            }
        }
        process.reader.abort();
        Ok(())
    }

    async fn send_message(&self, recipient: &str, payload: &OutgoingPayload) -> Result<String> {
        let result = self
            .request(
                "send_message",
                json!({ "recipient": recipient, "payload": payload }),
            )
            .await?;
        Ok(result
            .get("id")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .or_else(|| result.as_str().map(ToString::to_string))
            .unwrap_or_default())
    }

    async fn get_state(&self) -> Result<String> {
        let result = self.request("get_state", json!({})).await?;
        result
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| anyhow!("bridge returned non-string state: {result}"))
    }

    fn info(&self) -> Option<AccountInfo> {
        self.info.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_event_maps_known_names() {
        assert!(matches!(
            parse_event("qr", json!("2@abc")),
            Some(TransportEvent::Qr(code)) if code == "2@abc"
        ));
        assert!(matches!(
            parse_event("disconnected", json!("NAVIGATION")),
            Some(TransportEvent::Disconnected(reason)) if reason == "NAVIGATION"
        ));
        assert!(matches!(
            parse_event("loading_screen", json!({"percent": 100, "message": "WhatsApp"})),
            Some(TransportEvent::LoadingProgress { percent: 100, .. })
        ));
        assert!(parse_event("change_battery", json!({})).is_none());
    }

    #[test]
    fn parse_event_reads_message_payload() {
        let event = parse_event(
            "message",
            json!({"id": "M1", "from": "111@c.us", "body": "hola", "type": "chat"}),
        );
        match event {
            Some(TransportEvent::Message(raw)) => {
                assert_eq!(raw.id, "M1");
                assert_eq!(raw.body, "hola");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn qr_without_string_payload_is_dropped() {
        assert!(parse_event("qr", json!({"code": 1})).is_none());
    }

    #[tokio::test]
    async fn responses_resolve_pending_requests() {
        let (tx, _rx) = mpsc::channel(4);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let info = Arc::new(Mutex::new(None));
        let (waiter_tx, waiter_rx) = oneshot::channel();
        pending.lock().insert(3, waiter_tx);

        dispatch_line(
            "100",
            r#"{"type":"response","id":3,"ok":false,"error":"no session"}"#,
            &tx,
            &pending,
            &info,
        )
        .await;

        let err = waiter_rx.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("no session"));
        assert!(pending.lock().is_empty());
    }

    #[tokio::test]
    async fn ready_event_captures_account_info() {
        let (tx, mut rx) = mpsc::channel(4);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let info = Arc::new(Mutex::new(None));

        dispatch_line(
            "100",
            r#"{"type":"event","event":"ready","data":{"wid":"100@c.us","pushname":"Ops"}}"#,
            &tx,
            &pending,
            &info,
        )
        .await;

        assert!(matches!(rx.recv().await, Some(TransportEvent::Ready)));
        assert_eq!(info.lock().as_ref().unwrap().wid, "100@c.us");
    }

    /// Replies `CONNECTED` to every request, after announcing its own
    /// launch arguments as a challenge event.
    #[cfg(unix)]
    const RESPONDER: &str = r#"
printf '{"type":"event","event":"qr","data":"%s %s %s"}\n' "$2" "$4" "$6"
while read -r line; do
  id=$(printf '%s' "$line" | sed 's/.*"id":\([0-9]*\).*/\1/')
  printf '{"type":"response","id":%s,"ok":true,"result":"CONNECTED"}\n' "$id"
done
"#;

    /// Answers `initialize`, then exits.
    #[cfg(unix)]
    const ONE_SHOT: &str = r#"
read -r line
id=$(printf '%s' "$line" | sed 's/.*"id":\([0-9]*\).*/\1/')
printf '{"type":"response","id":%s,"ok":true,"result":null}\n' "$id"
"#;

    /// Reads requests and never answers.
    #[cfg(unix)]
    const SILENT: &str = "while read -r line; do :; done";

    #[cfg(unix)]
    fn sh_bridge(script: &str, command_timeout: Duration) -> TransportHandle {
        BridgeFactory::new(
            "sh".into(),
            vec!["-c".into(), script.into(), "bridge".into()],
            command_timeout,
        )
        .create(&TransportSpec {
            identity: "100".into(),
            session_path: "/tmp/relaygate-bridge-test".into(),
            debug_port: 9401,
        })
        .unwrap()
    }

    #[cfg(unix)]
    async fn next_event(events: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("bridge event")
            .expect("event channel open")
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawned_bridge_answers_requests() {
        let TransportHandle { client, mut events } = sh_bridge(RESPONDER, Duration::from_secs(5));

        client.initialize().await.unwrap();
        assert_eq!(client.get_state().await.unwrap(), "CONNECTED");
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Qr(args) if args == "100 /tmp/relaygate-bridge-test 9401"
        ));
        client.destroy().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_bridge_reports_disconnect() {
        let TransportHandle { client, mut events } = sh_bridge(ONE_SHOT, Duration::from_secs(5));

        client.initialize().await.unwrap();
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Disconnected(reason) if reason == "bridge exited"
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn destroyed_bridge_exits_quietly() {
        let TransportHandle { client, mut events } = sh_bridge(RESPONDER, Duration::from_secs(5));
        client.initialize().await.unwrap();
        assert!(matches!(next_event(&mut events).await, TransportEvent::Qr(_)));

        client.destroy().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(events.try_recv().is_err());
        assert!(client.get_state().await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_bridge_times_out() {
        let TransportHandle { client, .. } = sh_bridge(SILENT, Duration::from_millis(200));

        let err = client.initialize().await.unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
        client.destroy().await.unwrap();
    }

    #[test]
    fn factory_rejects_empty_command() {
        let factory = BridgeFactory::new("  ".into(), vec![], Duration::from_secs(1));
        let spec = TransportSpec {
            identity: "100".into(),
            session_path: "/tmp/s".into(),
            debug_port: 9222,
        };
        assert!(factory.create(&spec).is_err());
    }
}
