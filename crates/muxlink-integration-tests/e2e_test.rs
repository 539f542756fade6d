// End-to-end scenarios across the HTTP pipeline and the multiplexed
// protocol, driven through the public surfaces only.

use muxlink_config::{ChainRef, RetryDelay, UrlParts};
use muxlink_proto::{FileBlob, FrameOptions, MdpCodec, MdpPayload, MfpCodec};
use muxlink_runtime::{
    AsyncQueue, CallOptions, Dispatcher, DispatcherOptions, EndpointDefaults,
    EndpointEventHandler, Error, ExchangeStatus, ExchangeValue, Flow, HttpContext,
    IncomingRequest, Middleware, Options, PairTransport, RequestStatus, SendControls, Stack,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn dispatcher_pair() -> (Dispatcher, Dispatcher) {
    let (left, right) = PairTransport::pair();
    (
        Dispatcher::new(
            Arc::new(left),
            MdpCodec::new(MfpCodec::new()),
            DispatcherOptions::default(),
        ),
        Dispatcher::new(
            Arc::new(right),
            MdpCodec::new(MfpCodec::new()),
            DispatcherOptions::default(),
        ),
    )
}

// ---------------------------------------------------------------------------
// A1: three attempts spaced by the retry delay, then success
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_post_retries_twice_then_succeeds() {
    struct FailTwice {
        calls: Arc<AtomicU32>,
    }

    #[async_trait::async_trait]
    impl Middleware for FailTwice {
        fn kind(&self) -> &str {
            "fail-twice"
        }

        async fn process(&self, _ctx: &HttpContext, _value: Value) -> muxlink_runtime::Result<Flow> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= 2 {
                Err(Error::Send("connection reset".into()))
            } else {
                Ok(Flow::Next(json!({"a": 1})))
            }
        }
    }

    let calls = Arc::new(AtomicU32::new(0));
    let stack = Stack::builder()
        .middleware(Arc::new(FailTwice {
            calls: calls.clone(),
        }))
        .unwrap()
        .class("http", Options::new().executor(ChainRef::kind("fail-twice")))
        .unwrap()
        .endpoint(
            "flaky.post",
            Options::new()
                .kind("http")
                .method("POST")
                .retries(2)
                .retry_delay(RetryDelay::fixed(100)),
        )
        .unwrap()
        .build()
        .unwrap();

    let started = Instant::now();
    let ctx = stack
        .context("flaky.post", CallOptions::body(json!({"payload": true})))
        .unwrap();
    let outcome = ctx.run().await;
    let elapsed = started.elapsed();

    assert!(outcome.ok);
    assert_eq!(outcome.value, Some(json!({"a": 1})));
    assert_eq!(ctx.attempt(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // Two delays of ~100ms each separate the three attempts.
    assert!(elapsed >= Duration::from_millis(180), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(600), "{:?}", elapsed);
}

// ---------------------------------------------------------------------------
// A2: a timeout beats a slow server and suppresses retries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_timeout_against_slow_server() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/slow")
        .with_status(200)
        .with_body_from_request(|_| {
            std::thread::sleep(Duration::from_millis(500));
            "late".into()
        })
        .create_async()
        .await;

    let stack = Stack::builder()
        .endpoint(
            "slow.get",
            Options::new()
                .url(UrlParts::parse(&format!("{}/slow", server.url())).unwrap())
                .method("GET")
                .timeout_ms(100)
                .retries(3),
        )
        .unwrap()
        .build()
        .unwrap();

    let ctx = stack.context("slow.get", CallOptions::default()).unwrap();
    let outcome = ctx.run().await;
    assert!(!outcome.ok);
    assert!(outcome.value.is_none());
    assert_eq!(ctx.status(), RequestStatus::Timeout);
    assert!(matches!(outcome.error, Some(Error::Timeout(_))));
    // Interrupt errors never retry.
    assert_eq!(ctx.attempt(), 1);
}

// ---------------------------------------------------------------------------
// A3: priority-ordered execution within one queue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_queue_runs_highest_priority_first() {
    let queue = AsyncQueue::new("jobs", 1);
    let order = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new(tokio::sync::Notify::new());
    {
        let gate = gate.clone();
        queue.add(u32::MAX, None, move || async move {
            gate.notified().await;
            Ok(())
        });
    }
    for priority in [0u32, 5, 10] {
        let order = order.clone();
        queue.add(priority, None, move || async move {
            order.lock().unwrap().push(priority);
            Ok(())
        });
    }
    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*order.lock().unwrap(), vec![10, 5, 0]);
}

// ---------------------------------------------------------------------------
// A4: request with a peer-reported division error
// ---------------------------------------------------------------------------

struct Calculator;

#[async_trait::async_trait]
impl EndpointEventHandler for Calculator {
    async fn on_request(&self, request: Arc<IncomingRequest>) {
        let data = request.request().data.clone().unwrap_or(Value::Null);
        let v1 = data["value1"].as_f64().unwrap_or(0.0);
        let v2 = data["value2"].as_f64().unwrap_or(0.0);
        let (data, error) = if data["operation"] == "/" && v2 == 0.0 {
            (
                Some(Value::Null),
                Some(json!({"message": "division by zero"})),
            )
        } else {
            (Some(json!({"result": v1 / v2})), None)
        };
        request
            .respond(data, error, None, FrameOptions::default())
            .unwrap();
    }
}

#[tokio::test]
async fn test_calculator_division_by_zero() {
    let (client, server) = dispatcher_pair();
    server
        .register_endpoint("calculator", Arc::new(Calculator), EndpointDefaults::default())
        .unwrap();

    let ctx = client.request(
        "calculator",
        Some(json!({"value1": 6, "value2": 0, "operation": "/"})),
        None,
        SendControls::acked(),
    );
    let result = ctx.result().await;
    assert!(result.ok);
    assert_eq!(result.status, ExchangeStatus::Complete);
    match result.value {
        Some(ExchangeValue::Payload(payload)) => {
            assert_eq!(payload.data, Some(Value::Null));
            assert!(!payload.error.unwrap()["message"]
                .as_str()
                .unwrap()
                .is_empty());
        }
        other => panic!("expected payload, got {:?}", other),
    }
}

// ---------------------------------------------------------------------------
// A5: announce, stream one binary, peer reports the copied file
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_announced_binary_reassembled_and_copied_back() {
    /// Receives announcements and chunks for one file, then reports the
    /// reassembled content as a `files.copy` message.
    struct Receiver {
        announced: Mutex<BTreeMap<u32, (String, String, Vec<u8>)>>,
        reply_to: Mutex<Option<Arc<muxlink_runtime::EndpointHandle>>>,
    }

    #[async_trait::async_trait]
    impl EndpointEventHandler for Receiver {
        async fn on_message(&self, payload: MdpPayload) {
            let mut announced = self.announced.lock().unwrap();
            for (key, name, mime) in payload.filemap.unwrap_or_default() {
                announced.insert(key, (name, mime, Vec::new()));
            }
        }

        async fn on_binary(&self, _id: u32, body: muxlink_proto::BinaryBody) {
            {
                let mut announced = self.announced.lock().unwrap();
                if let Some(key) = body.scope.key() {
                    if let (Some(slot), Some(bin)) = (announced.get_mut(&key), &body.bin) {
                        slot.2.extend_from_slice(bin);
                    }
                }
            }
            if body.last {
                let files: BTreeMap<u32, FileBlob> = self
                    .announced
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|(key, (name, mime, bin))| {
                        (
                            *key,
                            FileBlob {
                                name: name.clone(),
                                mime: mime.clone(),
                                bin: bin.clone(),
                            },
                        )
                    })
                    .collect();
                if let Some(reply) = self.reply_to.lock().unwrap().clone() {
                    reply.message_lite(None, Some(&files)).unwrap();
                }
            }
        }
    }

    struct CopySink {
        received: Mutex<Option<BTreeMap<u32, FileBlob>>>,
    }

    #[async_trait::async_trait]
    impl EndpointEventHandler for CopySink {
        async fn on_message(&self, payload: MdpPayload) {
            *self.received.lock().unwrap() = payload.files;
        }
    }

    let (client, server) = dispatcher_pair();

    let receiver = Arc::new(Receiver {
        announced: Mutex::new(BTreeMap::new()),
        reply_to: Mutex::new(None),
    });
    server
        .register_endpoint("files.recv", receiver.clone(), EndpointDefaults::default())
        .unwrap();
    server.set_binary_endpoint(Some("files.recv".into()));
    let reply_handle = server
        .register_endpoint("files.copy", Arc::new(CopySink { received: Mutex::new(None) }), EndpointDefaults::default())
        .unwrap();
    // The server replies through its own `files.copy` handle.
    *receiver.reply_to.lock().unwrap() = Some(reply_handle);

    let copy_sink = Arc::new(CopySink {
        received: Mutex::new(None),
    });
    client
        .register_endpoint("files.copy", copy_sink.clone(), EndpointDefaults::default())
        .unwrap();

    let original = vec![42u8; 100];
    let announce = client.announce(
        "files.recv",
        None,
        Some(vec![(0, "blob.bin".into(), "application/octet-stream".into())]),
        Some([0u32].into_iter().collect()),
        SendControls::acked(),
    );
    assert!(announce.ack().await);
    client
        .binary_lite(
            announce.id(),
            muxlink_proto::BinaryScope::Expected(0),
            Some(original.clone()),
            false,
        )
        .unwrap();
    client
        .binary_lite(announce.id(), muxlink_proto::BinaryScope::Expected(0), None, true)
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let files = copy_sink
        .received
        .lock()
        .unwrap()
        .clone()
        .expect("files.copy not delivered");
    assert_eq!(files[&0].bin, original);
}

// ---------------------------------------------------------------------------
// A6: ack, then local abort, then the late response is unclaimed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_abort_between_ack_and_response() {
    struct Parked {
        requests: Mutex<Vec<Arc<IncomingRequest>>>,
    }

    #[async_trait::async_trait]
    impl EndpointEventHandler for Parked {
        async fn on_request(&self, request: Arc<IncomingRequest>) {
            self.requests.lock().unwrap().push(request);
        }
    }

    let (client, server) = dispatcher_pair();
    let parked = Arc::new(Parked {
        requests: Mutex::new(Vec::new()),
    });
    server
        .register_endpoint("slow", parked.clone(), EndpointDefaults::default())
        .unwrap();

    let ctx = client.request("slow", Some(json!({})), None, SendControls::acked());
    assert!(ctx.ack().await);

    ctx.abort();
    let result = ctx.result().await;
    assert!(!result.ok);
    assert_eq!(result.status, ExchangeStatus::Abort);
    assert!(matches!(result.error, Some(Error::Abort(_))));

    // The peer's incoming context was cancelled by our service-abort, so a
    // late respond attempt fails locally.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let request = parked.requests.lock().unwrap().pop().unwrap();
    assert!(request.abort_signal().is_fired());
    assert!(request
        .respond(Some(json!({"late": true})), None, None, FrameOptions::default())
        .is_err());
}

// ---------------------------------------------------------------------------
// Law 8: for an acked request, the ack never lags the result
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_ack_resolves_no_later_than_result() {
    let (client, server) = dispatcher_pair();
    server
        .register_endpoint("calculator", Arc::new(Calculator), EndpointDefaults::default())
        .unwrap();

    let ctx = client.request(
        "calculator",
        Some(json!({"value1": 8, "value2": 2, "operation": "/"})),
        None,
        SendControls::acked(),
    );
    let result = ctx.result().await;
    assert!(result.ok);
    // By the time the result settles, the ack must already be true.
    assert!(ctx.ack().await);
}
