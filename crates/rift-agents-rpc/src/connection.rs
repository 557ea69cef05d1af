//! Request/notification peer over one framed byte stream.
//!
//! A reader task decodes inbound frames and routes them: responses complete
//! pending requests, notifications go to the [`InboundHandler`] in arrival
//! order, and inbound requests get a task each so a request that waits on a
//! human does not stall the stream. A writer task serialises outbound frames.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};

use crate::{
    codec::{FrameReader, FrameWriter},
    protocol::{JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse},
};

const OUTGOING_CAPACITY: usize = 256;

/// Connection error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("Connection is not running")]
    NotRunning,
    #[error("Connection closed before a response arrived")]
    ConnectionClosed,
    #[error("Remote error: {0}")]
    Remote(JsonRpcError),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Lifecycle of a connection. Once `Stopped`, a connection never restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Running,
    Stopped,
}

/// Runs on the reader task with the successful result of a request, before
/// any later inbound message is dispatched.
pub type ResponseHook = Box<dyn FnOnce(&Value) + Send>;

struct PendingRequest {
    tx: oneshot::Sender<Result<Value, RpcError>>,
    hook: Option<ResponseHook>,
}

type PendingMap = Arc<Mutex<HashMap<u64, PendingRequest>>>;

fn lock_pending(pending: &PendingMap) -> MutexGuard<'_, HashMap<u64, PendingRequest>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Receiver of engine-initiated traffic.
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    /// Answer an engine request. May wait indefinitely.
    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, JsonRpcError>;

    /// Handle an engine notification.
    async fn handle_notification(&self, method: &str, params: Value);
}

/// Live JSON-RPC peer.
pub struct Connection {
    outgoing: mpsc::Sender<String>,
    pending: PendingMap,
    next_id: AtomicU64,
    state: Arc<watch::Sender<ConnectionState>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Start reader and writer tasks over the given stream halves.
    #[must_use]
    pub fn start<R, W>(reader: R, writer: W, handler: Arc<dyn InboundHandler>) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outgoing, outgoing_rx) = mpsc::channel::<String>(OUTGOING_CAPACITY);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (state, _) = watch::channel(ConnectionState::Running);
        let state = Arc::new(state);

        let writer_task = tokio::spawn(write_loop(
            FrameWriter::new(writer),
            outgoing_rx,
            Arc::clone(&pending),
            Arc::clone(&state),
        ));

        let reader_task = tokio::spawn(read_loop(
            FrameReader::new(reader),
            handler,
            outgoing.clone(),
            Arc::clone(&pending),
            Arc::clone(&state),
        ));

        Arc::new(Self {
            outgoing,
            pending,
            next_id: AtomicU64::new(1),
            state,
            tasks: Mutex::new(vec![writer_task, reader_task]),
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == ConnectionState::Running
    }

    /// Resolves once the connection has stopped.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Stopped).await;
    }

    /// Send a request and wait for its result. There is no timeout.
    ///
    /// # Errors
    /// Returns `NotRunning` before sending on a stopped connection,
    /// `ConnectionClosed` if it stops while waiting, `Remote` on an error
    /// response.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.send_request(method, params, None).await
    }

    /// Like [`request`](Self::request), with `hook` run on the reader task
    /// as soon as a successful result arrives.
    ///
    /// # Errors
    /// Same as [`request`](Self::request).
    pub async fn request_with_hook(
        &self,
        method: &str,
        params: Value,
        hook: ResponseHook,
    ) -> Result<Value, RpcError> {
        self.send_request(method, params, Some(hook)).await
    }

    async fn send_request(
        &self,
        method: &str,
        params: Value,
        hook: Option<ResponseHook>,
    ) -> Result<Value, RpcError> {
        if !self.is_running() {
            return Err(RpcError::NotRunning);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = serde_json::to_string(&JsonRpcRequest::new(id, method, Some(params)))?;

        let rx = self.register(id, hook)?;

        tracing::debug!(id, method, "sending request");
        if self.outgoing.send(body).await.is_err() {
            lock_pending(&self.pending).remove(&id);
            return Err(RpcError::ConnectionClosed);
        }

        rx.await.map_err(|_| RpcError::ConnectionClosed)?
    }

    /// Park a response slot for `id`. `stop` flips the state before draining,
    /// so a slot inserted after the drain is caught by the second check.
    fn register(
        &self,
        id: u64,
        hook: Option<ResponseHook>,
    ) -> Result<oneshot::Receiver<Result<Value, RpcError>>, RpcError> {
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, PendingRequest { tx, hook });
        if !self.is_running() {
            lock_pending(&self.pending).remove(&id);
            return Err(RpcError::NotRunning);
        }
        Ok(rx)
    }

    /// Send a notification. Nothing is awaited beyond queueing the frame.
    ///
    /// # Errors
    /// Returns `NotRunning` on a stopped connection.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), RpcError> {
        if !self.is_running() {
            return Err(RpcError::NotRunning);
        }
        let body = serde_json::to_string(&JsonRpcNotification::new(method, Some(params)))?;
        tracing::debug!(method, "sending notification");
        self.outgoing
            .send(body)
            .await
            .map_err(|_| RpcError::NotRunning)
    }

    /// Stop both tasks and fail every pending request.
    pub fn close(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
        stop(&self.state, &self.pending);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn stop(state: &watch::Sender<ConnectionState>, pending: &PendingMap) {
    state.send_replace(ConnectionState::Stopped);
    let drained: Vec<_> = lock_pending(pending).drain().collect();
    for (_, request) in drained {
        let _ = request.tx.send(Err(RpcError::ConnectionClosed));
    }
}

async fn write_loop<W>(
    mut writer: FrameWriter<W>,
    mut outgoing: mpsc::Receiver<String>,
    pending: PendingMap,
    state: Arc<watch::Sender<ConnectionState>>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(body) = outgoing.recv().await {
        if let Err(e) = writer.write_frame(&body).await {
            tracing::error!("Failed to write to engine: {e}");
            break;
        }
    }
    stop(&state, &pending);
}

async fn read_loop<R>(
    mut reader: FrameReader<R>,
    handler: Arc<dyn InboundHandler>,
    outgoing: mpsc::Sender<String>,
    pending: PendingMap,
    state: Arc<watch::Sender<ConnectionState>>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let body = match reader.read_frame().await {
            Ok(Some(body)) => body,
            Ok(None) => {
                tracing::info!("engine closed the connection");
                break;
            }
            Err(e) => {
                tracing::error!("Failed to read from engine: {e}");
                break;
            }
        };

        match JsonRpcMessage::parse(&body) {
            Ok(JsonRpcMessage::Response(response)) => complete(&pending, response),
            Ok(JsonRpcMessage::Notification(notification)) => {
                tracing::debug!(method = %notification.method, "inbound notification");
                handler
                    .handle_notification(
                        &notification.method,
                        notification.params.unwrap_or(Value::Null),
                    )
                    .await;
            }
            Ok(JsonRpcMessage::Request(request)) => {
                tracing::debug!(method = %request.method, "inbound request");
                let handler = Arc::clone(&handler);
                let outgoing = outgoing.clone();
                tokio::spawn(async move {
                    let params = request.params.unwrap_or(Value::Null);
                    let response = match handler.handle_request(&request.method, params).await {
                        Ok(result) => JsonRpcResponse::success(request.id, result),
                        Err(error) => JsonRpcResponse::failure(request.id, error),
                    };
                    match serde_json::to_string(&response) {
                        Ok(body) => {
                            if outgoing.send(body).await.is_err() {
                                tracing::warn!(method = %request.method, "connection gone before response");
                            }
                        }
                        Err(e) => tracing::error!("Failed to serialize response: {e}"),
                    }
                });
            }
            Err(e) => tracing::warn!("Unknown engine message: {e}: {body}"),
        }
    }

    stop(&state, &pending);
}

fn complete(pending: &PendingMap, response: JsonRpcResponse) {
    let Some(id) = response.id.as_u64() else {
        tracing::warn!(id = %response.id, "response with foreign id");
        return;
    };
    let Some(request) = lock_pending(pending).remove(&id) else {
        tracing::warn!(id, "response for unknown request");
        return;
    };

    let result = response.into_result().map_err(RpcError::Remote);
    if let (Ok(value), Some(hook)) = (&result, request.hook) {
        hook(value);
    }
    let _ = request.tx.send(result);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use serde_json::json;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    use super::*;

    /// Engine end of an in-memory connection.
    struct Engine {
        reader: FrameReader<ReadHalf<DuplexStream>>,
        writer: FrameWriter<WriteHalf<DuplexStream>>,
    }

    impl Engine {
        async fn recv(&mut self) -> Value {
            let body = self.reader.read_frame().await.unwrap().unwrap();
            serde_json::from_str(&body).unwrap()
        }

        async fn send(&mut self, value: Value) {
            self.writer.write_json(&value).await.unwrap();
        }
    }

    #[derive(Default)]
    struct Recorder {
        notifications: Mutex<Vec<(String, Value)>>,
        hook_ran_first: AtomicBool,
    }

    #[async_trait]
    impl InboundHandler for Recorder {
        async fn handle_request(&self, method: &str, params: Value) -> Result<Value, JsonRpcError> {
            match method {
                "echo" => Ok(params),
                _ => Err(JsonRpcError::method_not_found(method)),
            }
        }

        async fn handle_notification(&self, method: &str, params: Value) {
            self.notifications
                .lock()
                .unwrap()
                .push((method.to_string(), params));
        }
    }

    fn pair(handler: Arc<dyn InboundHandler>) -> (Arc<Connection>, Engine) {
        let (client, engine) = tokio::io::duplex(64 * 1024);
        let (cr, cw) = tokio::io::split(client);
        let (er, ew) = tokio::io::split(engine);
        let conn = Connection::start(cr, cw, handler);
        (
            conn,
            Engine {
                reader: FrameReader::new(er),
                writer: FrameWriter::new(ew),
            },
        )
    }

    #[tokio::test]
    async fn test_request_response() {
        let (conn, mut engine) = pair(Arc::new(Recorder::default()));

        let call = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.request("run", json!({"agent_type": "rift_chat"})).await }
        });

        let req = engine.recv().await;
        assert_eq!(req["method"], "run");
        assert_eq!(req["params"]["agent_type"], "rift_chat");
        engine
            .send(json!({"jsonrpc": "2.0", "id": req["id"], "result": {"id": "a1"}}))
            .await;

        assert_eq!(call.await.unwrap().unwrap(), json!({"id": "a1"}));
    }

    #[tokio::test]
    async fn test_remote_error() {
        let (conn, mut engine) = pair(Arc::new(Recorder::default()));
        let call = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.request("restart", json!({"id": "zz"})).await }
        });
        let req = engine.recv().await;
        engine
            .send(json!({"jsonrpc": "2.0", "id": req["id"], "error": {"code": -32000, "message": "no agent"}}))
            .await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::Remote(e) if e.code == -32000));
    }

    #[tokio::test]
    async fn test_hook_runs_before_next_message() {
        let recorder = Arc::new(Recorder::default());
        let (conn, mut engine) = pair(Arc::clone(&recorder) as Arc<dyn InboundHandler>);

        let flag = Arc::clone(&recorder);
        let call = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move {
                conn.request_with_hook(
                    "run",
                    json!({}),
                    Box::new(move |_| {
                        let seen = !flag.notifications.lock().unwrap().is_empty();
                        flag.hook_ran_first.store(!seen, Ordering::SeqCst);
                    }),
                )
                .await
            }
        });

        let req = engine.recv().await;
        engine
            .send(json!({"jsonrpc": "2.0", "id": req["id"], "result": {"id": "a1"}}))
            .await;
        engine
            .send(json!({"jsonrpc": "2.0", "method": "rift_chat_a1_send_update", "params": {"msg": "x"}}))
            .await;

        call.await.unwrap().unwrap();
        assert!(recorder.hook_ran_first.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_inbound_request_is_answered() {
        let (_conn, mut engine) = pair(Arc::new(Recorder::default()));

        engine
            .send(json!({"jsonrpc": "2.0", "id": "e1", "method": "echo", "params": {"k": 1}}))
            .await;
        let resp = engine.recv().await;
        assert_eq!(resp["id"], "e1");
        assert_eq!(resp["result"], json!({"k": 1}));

        engine
            .send(json!({"jsonrpc": "2.0", "id": 9, "method": "nope"}))
            .await;
        let resp = engine.recv().await;
        assert_eq!(resp["error"]["code"], crate::protocol::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_notifications_arrive_in_order() {
        let recorder = Arc::new(Recorder::default());
        let (conn, mut engine) = pair(Arc::clone(&recorder) as Arc<dyn InboundHandler>);

        for i in 0..5 {
            engine
                .send(json!({"jsonrpc": "2.0", "method": "tick", "params": i}))
                .await;
        }
        // Round-trip a request so all earlier frames have been processed.
        let call = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.request("ping", Value::Null).await }
        });
        let req = engine.recv().await;
        engine
            .send(json!({"jsonrpc": "2.0", "id": req["id"], "result": null}))
            .await;
        assert_eq!(call.await.unwrap().unwrap(), Value::Null);

        let seen: Vec<Value> = recorder
            .notifications
            .lock()
            .unwrap()
            .iter()
            .map(|(_, p)| p.clone())
            .collect();
        assert_eq!(seen, (0..5).map(Value::from).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_engine_drop_stops_connection() {
        let (conn, mut engine) = pair(Arc::new(Recorder::default()));

        let call = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.request("run", json!({})).await }
        });
        let _ = engine.recv().await;
        drop(engine);

        assert_eq!(call.await.unwrap().unwrap_err(), RpcError::ConnectionClosed);
        conn.closed().await;
        assert_eq!(conn.state(), ConnectionState::Stopped);
        assert_eq!(
            conn.notify("cancel", json!({"id": "a1"})).await.unwrap_err(),
            RpcError::NotRunning
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (conn, _engine) = pair(Arc::new(Recorder::default()));
        conn.close();
        conn.close();
        assert!(!conn.is_running());
        assert_eq!(
            conn.request("run", json!({})).await.unwrap_err(),
            RpcError::NotRunning
        );
    }

    #[tokio::test]
    async fn test_slot_registered_after_stop_is_not_left_waiting() {
        let (conn, _engine) = pair(Arc::new(Recorder::default()));
        conn.close();

        // Registration that lost the race with `stop` must not leave a slot
        // nobody will ever complete.
        assert_eq!(conn.register(7, None).unwrap_err(), RpcError::NotRunning);
        assert!(lock_pending(&conn.pending).is_empty());
    }
}
