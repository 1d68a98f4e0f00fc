use async_trait::async_trait;
use serde_json::json;
use serial_test::serial;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tabrelay_common::error::TransportError;
use tabrelay_common::protocol::{ContextRequest, ContextResponse, TargetId};
use tabrelay_common::task::{FetchRequest, FetchResponse, NodeIdentity, ReplyRequest};
use tabrelay_engine::config::DispatcherSettings;
use tabrelay_engine::link::{IncomingRequest, Link};
use tabrelay_r::dispatcher::Dispatcher;
use tabrelay_r::hub::{ContextChannel, ContextHub, RequestHandler};
use tabrelay_r::identity::MemoryIdentityStore;
use tabrelay_r::queue::InstructionQueue;
use tabrelay_r::registry::ConnectionRegistry;
use tabrelay_r::task_server::{TaskServer, TaskServerError};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;

const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct RecordingHandler {
    seen: Mutex<Vec<(TargetId, &'static str)>>,
    gone: Mutex<Vec<TargetId>>,
}

impl RecordingHandler {
    fn actions(&self) -> Vec<&'static str> {
        self.seen.lock().unwrap().iter().map(|(_, a)| *a).collect()
    }
}

#[async_trait]
impl RequestHandler for RecordingHandler {
    async fn handle(&self, from: &TargetId, request: ContextRequest) -> ContextResponse {
        self.seen
            .lock()
            .unwrap()
            .push((from.clone(), request.action()));
        match request {
            ContextRequest::ContextReady { target, .. } if target.as_str() == "refused" => {
                ContextResponse::error("not welcome")
            }
            ContextRequest::GetInstructionsCount => ContextResponse::ok(Some(json!(7))),
            _ => ContextResponse::ok(None),
        }
    }

    async fn disconnected(&self, target: &TargetId) {
        self.gone.lock().unwrap().push(target.clone());
    }
}

async fn start_hub(handler: Arc<dyn RequestHandler>) -> (ContextHub, SocketAddr) {
    let hub = ContextHub::new(TIMEOUT);
    let (addr, _accept) = hub.start(0, handler).await.unwrap();
    (hub, addr)
}

async fn client(addr: SocketAddr) -> (Link, mpsc::Receiver<IncomingRequest>) {
    let (ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
    Link::spawn(ws, TIMEOUT)
}

fn ready(target: &str, index: u32) -> ContextRequest {
    ContextRequest::ContextReady {
        target: TargetId::new(target),
        index,
        url: "about:blank".into(),
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never became true");
}

#[tokio::test]
#[serial]
async fn test_context_registers_and_answers_requests() {
    let handler = Arc::new(RecordingHandler::default());
    let (hub, addr) = start_hub(handler.clone()).await;
    let (link, mut incoming) = client(addr).await;

    let ack = link.request(ready("tab-1", 1)).await.unwrap();
    assert!(ack.ok);
    let target = TargetId::new("tab-1");
    assert!(hub.has_context(&target));
    assert_eq!(hub.connected(), vec![target.clone()]);

    // context -> hub
    let count = link
        .request(ContextRequest::GetInstructionsCount)
        .await
        .unwrap();
    assert_eq!(count.data, Some(json!(7)));

    // hub -> context
    let answer = tokio::spawn(async move {
        let req = incoming.recv().await.unwrap();
        assert_eq!(req.request, ContextRequest::Ping);
        link.respond(req.id, ContextResponse::ok(Some(json!({"target": "tab-1"}))))
            .await
            .unwrap();
        (link, incoming)
    });
    let pong = hub.request(&target, ContextRequest::Ping).await.unwrap();
    assert!(pong.ok);
    assert_eq!(pong.data.unwrap()["target"], "tab-1");
    let _keep = answer.await.unwrap();

    assert_eq!(
        handler.actions(),
        vec!["contextReady", "getInstructionsCount"]
    );
}

#[tokio::test]
#[serial]
async fn test_unknown_target_has_no_receiver() {
    let (hub, _addr) = start_hub(Arc::new(RecordingHandler::default())).await;
    let err = hub
        .request(&TargetId::new("nobody"), ContextRequest::Notify)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::NoReceiver(_)));
}

#[tokio::test]
#[serial]
async fn test_first_frame_must_be_context_ready() {
    let handler = Arc::new(RecordingHandler::default());
    let (hub, addr) = start_hub(handler.clone()).await;
    let (link, _incoming) = client(addr).await;

    let response = link
        .request(ContextRequest::GetSingleInstruction)
        .await
        .unwrap();
    assert!(!response.ok);
    assert!(response.error.unwrap().contains("contextReady"));
    assert!(hub.connected().is_empty());
    assert!(handler.actions().is_empty());
}

#[tokio::test]
#[serial]
async fn test_refused_context_is_not_routed() {
    let handler = Arc::new(RecordingHandler::default());
    let (hub, addr) = start_hub(handler.clone()).await;
    let (link, _incoming) = client(addr).await;

    let response = link.request(ready("refused", 0)).await.unwrap();
    assert!(!response.ok);
    assert!(!hub.has_context(&TargetId::new("refused")));
}

#[tokio::test]
#[serial]
async fn test_close_notifies_handler() {
    let handler = Arc::new(RecordingHandler::default());
    let (hub, addr) = start_hub(handler.clone()).await;
    let target = TargetId::new("tab-2");

    {
        let (link, incoming) = client(addr).await;
        assert!(link.request(ready("tab-2", 2)).await.unwrap().ok);
        assert!(hub.has_context(&target));
        drop(incoming);
        drop(link);
    }

    wait_until(|| !handler.gone.lock().unwrap().is_empty()).await;
    assert_eq!(*handler.gone.lock().unwrap(), vec![target.clone()]);
    assert!(!hub.has_context(&target));
}

#[tokio::test]
#[serial]
async fn test_reconnect_keeps_newer_route() {
    let handler = Arc::new(RecordingHandler::default());
    let (hub, addr) = start_hub(handler.clone()).await;
    let target = TargetId::new("tab-3");

    let (old, old_incoming) = client(addr).await;
    assert!(old.request(ready("tab-3", 3)).await.unwrap().ok);
    let (new, _new_incoming) = client(addr).await;
    assert!(new.request(ready("tab-3", 3)).await.unwrap().ok);

    drop(old_incoming);
    drop(old);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // the stale connection closing must not unroute the fresh one
    assert!(hub.has_context(&target));
    assert!(handler.gone.lock().unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn test_reconnect_closes_replaced_link() {
    let handler = Arc::new(RecordingHandler::default());
    let (hub, addr) = start_hub(handler.clone()).await;
    let target = TargetId::new("tab-4");

    let (old, _old_incoming) = client(addr).await;
    assert!(old.request(ready("tab-4", 4)).await.unwrap().ok);
    let (new, _new_incoming) = client(addr).await;
    assert!(new.request(ready("tab-4", 4)).await.unwrap().ok);

    wait_until(|| old.is_closed()).await;
    assert!(!new.is_closed());
    assert!(hub.has_context(&target));
    assert!(handler.gone.lock().unwrap().is_empty());
}

// --- Dispatcher over a real hub ---

#[derive(Default)]
struct QuietServer {
    replies: Mutex<Vec<ReplyRequest>>,
}

#[async_trait]
impl TaskServer for QuietServer {
    async fn login(&self, _identity: &NodeIdentity) -> Result<String, TaskServerError> {
        Ok("token".into())
    }

    async fn fetch(
        &self,
        _token: &str,
        _request: &FetchRequest,
    ) -> Result<FetchResponse, TaskServerError> {
        Ok(FetchResponse::default())
    }

    async fn reply_instructions(
        &self,
        _token: &str,
        request: &ReplyRequest,
    ) -> Result<(), TaskServerError> {
        self.replies.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn reply_task(&self, _token: &str, _request: &ReplyRequest) -> Result<(), TaskServerError> {
        Ok(())
    }
}

#[tokio::test]
#[serial]
async fn test_notified_context_pulls_its_queue() {
    let hub = ContextHub::new(TIMEOUT);
    let queue = Arc::new(InstructionQueue::new());
    let registry = Arc::new(ConnectionRegistry::new());
    let dispatcher = Arc::new(Dispatcher::new(
        queue.clone(),
        registry.clone(),
        Arc::new(hub.clone()),
        Arc::new(QuietServer::default()),
        Arc::new(MemoryIdentityStore::new()),
        DispatcherSettings::default(),
    ));
    let (addr, _accept) = hub.start(0, dispatcher.clone()).await.unwrap();

    let (link, mut incoming) = client(addr).await;
    assert!(link.request(ready("tab-1", 1)).await.unwrap().ok);
    let target = TargetId::new("tab-1");
    assert!(registry.is_connected(&target));

    queue.enqueue(
        &target,
        vec![
            json!({"type": "navigate", "id": "n1", "url": "https://example.com"}),
            json!({"type": "click", "id": "c1", "elementName": "go"}),
        ],
    );

    // a minimal context: answer ping/notify, then drain one at a time
    let context = tokio::spawn(async move {
        let mut pulled = Vec::new();
        while let Some(req) = incoming.recv().await {
            let notify = req.request == ContextRequest::Notify;
            link.respond(req.id, ContextResponse::ok(None)).await.unwrap();
            if notify {
                loop {
                    let next = link
                        .request(ContextRequest::GetSingleInstruction)
                        .await
                        .unwrap();
                    match next.into_data() {
                        Some(instruction) => pulled.push(instruction["id"].clone()),
                        None => return pulled,
                    }
                }
            }
        }
        pulled
    });

    let report = dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.notified, vec![target.clone()]);
    assert!(!report.fetched);

    let pulled = tokio::time::timeout(TIMEOUT, context)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pulled, vec![json!("n1"), json!("c1")]);
    assert_eq!(queue.total_pending(), 0);
}
