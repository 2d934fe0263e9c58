//! End-to-end invocation-loop tests against a scripted control plane
//! speaking raw HTTP/1.1 over loopback TCP.

use bytes::Bytes;
use lambda_bootstrap::{
    service_fn, ClientError, Config, Diagnostic, InitError, LambdaInvocation, ProtocolError,
    Runtime,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const ACCEPTED: &[u8] = b"HTTP/1.1 202 Accepted\r\n\r\n";

#[derive(Debug)]
struct BadInput;

impl From<BadInput> for Diagnostic {
    fn from(_: BadInput) -> Diagnostic {
        Diagnostic::new("BadInput", "bad")
    }
}

#[derive(Debug)]
struct ConfigMissing;

impl From<ConfigMissing> for Diagnostic {
    fn from(_: ConfigMissing) -> Diagnostic {
        Diagnostic::new("ConfigMissing", "TABLE_NAME is not set")
    }
}

async fn bind_control_plane() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

fn test_config(endpoint: SocketAddr, max_invocations: u32) -> Config {
    let mut config = Config::default();
    config.api_endpoint = endpoint;
    config.max_invocations = max_invocations;
    config
}

/// Read one request: the head as text plus the content-length body.
async fn read_request(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut collected = Vec::new();
    let mut byte = [0u8; 1];
    while !collected.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.expect("request bytes");
        collected.push(byte[0]);
    }
    let head = String::from_utf8(collected).unwrap();
    let length = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length: "))
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await.expect("request body");
    (head, body)
}

fn next_response(request_id: &str, payload: &[u8]) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 200 OK\r\n\
         Lambda-Runtime-Aws-Request-Id: {request_id}\r\n\
         Lambda-Runtime-Deadline-Ms: 1542409706888\r\n\
         Lambda-Runtime-Invoked-Function-Arn: arn:aws:lambda:us-east-1:123456789012:function:custom-runtime\r\n\
         Lambda-Runtime-Trace-Id: Root=1-5bef4de7-ad49b0e87f6ef6c87fc2e700;Parent=9a9197af755a6419;Sampled=1\r\n\
         Content-Length: {}\r\n\
         \r\n",
        payload.len()
    )
    .into_bytes();
    response.extend_from_slice(payload);
    response
}

#[tokio::test]
async fn happy_path_reports_the_handler_output() {
    let (listener, addr) = bind_control_plane().await;
    let request_id = "8476a536-e9f4-11e8-9739-2dfe598c3fcd";

    let control_plane = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let (head, _) = read_request(&mut stream).await;
        assert!(head.starts_with("GET /2018-06-01/runtime/invocation/next HTTP/1.1\r\n"));
        assert!(head.contains("user-agent: Swift-Lambda/Unknown\r\n"));
        stream
            .write_all(&next_response(request_id, b"hello, world!"))
            .await
            .unwrap();

        let (head, body) = read_request(&mut stream).await;
        assert!(head.starts_with(&format!(
            "POST /2018-06-01/runtime/invocation/{request_id}/response HTTP/1.1\r\n"
        )));
        assert_eq!(body, b"hello, world!");
        stream.write_all(ACCEPTED).await.unwrap();
    });

    let handler = service_fn(|invocation: LambdaInvocation| async move {
        Ok::<Bytes, Diagnostic>(invocation.payload)
    });
    Runtime::new(test_config(addr, 1)).run(handler).await.unwrap();
    control_plane.await.unwrap();
}

#[tokio::test]
async fn max_requests_bounds_the_loop() {
    let (listener, addr) = bind_control_plane().await;
    let ids = [
        "00000000-0000-4000-8000-000000000001",
        "00000000-0000-4000-8000-000000000002",
        "00000000-0000-4000-8000-000000000003",
    ];

    let control_plane = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        for id in ids {
            let (head, _) = read_request(&mut stream).await;
            assert!(head.starts_with("GET "));
            stream.write_all(&next_response(id, b"{}")).await.unwrap();

            let (head, _) = read_request(&mut stream).await;
            assert!(head.contains(&format!("/invocation/{id}/response ")));
            stream.write_all(ACCEPTED).await.unwrap();
        }
        // the loop must stop here: the next read sees a clean close
        let mut probe = [0u8; 1];
        assert_eq!(stream.read(&mut probe).await.unwrap(), 0);
    });

    let handler = service_fn(|invocation: LambdaInvocation| async move {
        Ok::<Bytes, Diagnostic>(invocation.payload)
    });
    Runtime::new(test_config(addr, 3)).run(handler).await.unwrap();
    control_plane.await.unwrap();
}

#[tokio::test]
async fn handler_error_is_reported_and_the_loop_continues() {
    let (listener, addr) = bind_control_plane().await;
    let request_id = "8476a536-e9f4-11e8-9739-2dfe598c3fcd";

    let control_plane = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let _ = read_request(&mut stream).await;
        stream
            .write_all(&next_response(request_id, b"{\"bad\":true}"))
            .await
            .unwrap();

        let (head, body) = read_request(&mut stream).await;
        assert!(head.starts_with(&format!(
            "POST /2018-06-01/runtime/invocation/{request_id}/error HTTP/1.1\r\n"
        )));
        assert!(head.contains("lambda-runtime-function-error-type: Unhandled\r\n"));
        assert_eq!(body, br#"{"errorType":"BadInput","errorMessage":"bad"}"#);
        stream.write_all(ACCEPTED).await.unwrap();
    });

    let handler =
        service_fn(|_: LambdaInvocation| async move { Err::<Bytes, BadInput>(BadInput) });
    // a handler failure is reported, not fatal: the loop exits 0 at the limit
    Runtime::new(test_config(addr, 1)).run(handler).await.unwrap();
    control_plane.await.unwrap();
}

#[tokio::test]
async fn handler_panic_is_reported_as_a_failure() {
    let (listener, addr) = bind_control_plane().await;
    let request_id = "8476a536-e9f4-11e8-9739-2dfe598c3fcd";

    let control_plane = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let _ = read_request(&mut stream).await;
        stream
            .write_all(&next_response(request_id, b"{}"))
            .await
            .unwrap();

        let (head, body) = read_request(&mut stream).await;
        assert!(head.contains(&format!("/invocation/{request_id}/error ")));
        let text = String::from_utf8(body).unwrap();
        assert!(
            text.contains(r#""errorMessage":"Lambda panicked: boom""#),
            "{text}"
        );
        stream.write_all(ACCEPTED).await.unwrap();
    });

    let explode = true;
    let handler = service_fn(move |_: LambdaInvocation| async move {
        if explode {
            panic!("boom");
        }
        Ok::<Bytes, Diagnostic>(Bytes::new())
    });
    Runtime::new(test_config(addr, 1)).run(handler).await.unwrap();
    control_plane.await.unwrap();
}

#[tokio::test]
async fn init_failure_is_reported_and_fatal() {
    let (listener, addr) = bind_control_plane().await;

    let control_plane = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (head, body) = read_request(&mut stream).await;
        assert!(head.starts_with("POST /2018-06-01/runtime/init/error HTTP/1.1\r\n"));
        assert!(head.contains("lambda-runtime-function-error-type: Unhandled\r\n"));
        assert_eq!(
            body,
            br#"{"errorType":"ConfigMissing","errorMessage":"TABLE_NAME is not set"}"#
        );
        stream.write_all(ACCEPTED).await.unwrap();
        // no `/next` may follow a failed init
        let mut probe = [0u8; 1];
        assert_eq!(stream.read(&mut probe).await.unwrap(), 0);
    });

    let fail = true;
    let err = Runtime::new(test_config(addr, 0))
        .run_with_factory(move |_| async move {
            let handler = service_fn(|invocation: LambdaInvocation| async move {
                Ok::<Bytes, Diagnostic>(invocation.payload)
            });
            if fail {
                Err(ConfigMissing)
            } else {
                Ok(handler)
            }
        })
        .await
        .unwrap_err();
    let init_error = err.downcast_ref::<InitError>().expect("init error");
    assert_eq!(init_error.0.error_type, "ConfigMissing");
    control_plane.await.unwrap();
}

#[tokio::test]
async fn oversize_payload_is_fatal_without_reading_the_body() {
    let (listener, addr) = bind_control_plane().await;

    let control_plane = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_request(&mut stream).await;
        // 6 MiB + 1; no body follows
        let _ = stream
            .write_all(
                b"HTTP/1.1 200 OK\r\n\
                  Lambda-Runtime-Aws-Request-Id: 8476a536-e9f4-11e8-9739-2dfe598c3fcd\r\n\
                  Lambda-Runtime-Deadline-Ms: 1542409706888\r\n\
                  Lambda-Runtime-Invoked-Function-Arn: arn:aws:lambda:us-east-1:1:function:f\r\n\
                  Content-Length: 6291457\r\n\
                  \r\n",
            )
            .await;
        // the runtime hangs up instead of asking for anything else
        let mut probe = [0u8; 1];
        assert_eq!(stream.read(&mut probe).await.unwrap_or(0), 0);
    });

    let handler = service_fn(|invocation: LambdaInvocation| async move {
        Ok::<Bytes, Diagnostic>(invocation.payload)
    });
    let err = Runtime::new(test_config(addr, 0))
        .run(handler)
        .await
        .unwrap_err();
    let client_error = err.downcast_ref::<ClientError>().expect("client error");
    assert!(matches!(
        client_error,
        ClientError::Protocol(ProtocolError::InvalidContentLength)
    ));
    control_plane.await.unwrap();
}

#[tokio::test]
async fn shutdown_during_the_poll_exits_cleanly_and_drains_hooks() {
    let (listener, addr) = bind_control_plane().await;

    let control_plane = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_request(&mut stream).await;
        // hold the long poll open until the runtime hangs up
        let mut probe = [0u8; 1];
        let _ = stream.read(&mut probe).await;
    });

    let runtime = Runtime::new(test_config(addr, 0));
    let shutdown_handle = runtime.shutdown_handle();
    let drained = Arc::new(AtomicBool::new(false));
    let hook_flag = drained.clone();
    runtime.terminator().register("flush", move || {
        Box::pin(async move {
            hook_flag.store(true, Ordering::SeqCst);
            Ok(())
        })
    });

    let runtime_task = tokio::spawn(async move {
        let handler = service_fn(|invocation: LambdaInvocation| async move {
            Ok::<Bytes, Diagnostic>(invocation.payload)
        });
        runtime.run(handler).await
    });

    // let the loop park in the long poll before firing the stop signal path
    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown_handle.shutdown();

    runtime_task.await.unwrap().unwrap();
    assert!(drained.load(Ordering::SeqCst), "termination hook must run");
    control_plane.await.unwrap();
}

#[tokio::test]
async fn cancel_without_shutdown_fails_the_loop() {
    let (listener, addr) = bind_control_plane().await;

    let control_plane = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_request(&mut stream).await;
        let mut probe = [0u8; 1];
        let _ = stream.read(&mut probe).await;
    });

    let runtime = Runtime::new(test_config(addr, 0));
    let cancel = runtime.cancel_handle();

    let runtime_task = tokio::spawn(async move {
        let handler = service_fn(|invocation: LambdaInvocation| async move {
            Ok::<Bytes, Diagnostic>(invocation.payload)
        });
        runtime.run(handler).await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let err = runtime_task.await.unwrap().unwrap_err();
    let client_error = err.downcast_ref::<ClientError>().expect("client error");
    assert!(matches!(client_error, ClientError::Cancelled));
    control_plane.await.unwrap();
}

#[tokio::test]
async fn failed_hooks_combine_with_the_runtime_result() {
    let (listener, addr) = bind_control_plane().await;

    let control_plane = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_request(&mut stream).await;
        let mut probe = [0u8; 1];
        let _ = stream.read(&mut probe).await;
    });

    let runtime = Runtime::new(test_config(addr, 0));
    let shutdown_handle = runtime.shutdown_handle();
    let terminator = runtime.terminator();
    terminator.register("first", || Box::pin(async { Err("first failed".into()) }));
    terminator.register("second", || Box::pin(async { Ok(()) }));
    terminator.register("third", || Box::pin(async { Err("third failed".into()) }));

    let runtime_task = tokio::spawn(async move {
        let handler = service_fn(|invocation: LambdaInvocation| async move {
            Ok::<Bytes, Diagnostic>(invocation.payload)
        });
        runtime.run(handler).await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown_handle.shutdown();

    // clean loop exit + failed hooks: the termination error is the result
    let err = runtime_task.await.unwrap().unwrap_err();
    let rendered = err.to_string();
    assert!(rendered.contains("first failed"), "{rendered}");
    assert!(rendered.contains("third failed"), "{rendered}");
    control_plane.await.unwrap();
}

#[tokio::test]
async fn pipelined_reports_share_the_wire_with_the_next_poll() {
    let (listener, addr) = bind_control_plane().await;
    let first_id = "00000000-0000-4000-8000-00000000000a";
    let second_id = "00000000-0000-4000-8000-00000000000b";

    let control_plane = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let (head, _) = read_request(&mut stream).await;
        assert!(head.starts_with("GET "));
        stream.write_all(&next_response(first_id, b"one")).await.unwrap();

        // the report and the follow-up poll arrive back-to-back, before
        // either response goes out
        let (head, body) = read_request(&mut stream).await;
        assert!(head.contains(&format!("/invocation/{first_id}/response ")));
        assert_eq!(body, b"one");
        let (head, _) = read_request(&mut stream).await;
        assert!(head.starts_with("GET "));

        stream.write_all(ACCEPTED).await.unwrap();
        stream.write_all(&next_response(second_id, b"two")).await.unwrap();

        let (head, body) = read_request(&mut stream).await;
        assert!(head.contains(&format!("/invocation/{second_id}/response ")));
        assert_eq!(body, b"two");
        stream.write_all(ACCEPTED).await.unwrap();
    });

    let mut config = test_config(addr, 2);
    config.pipelining = true;
    let handler = service_fn(|invocation: LambdaInvocation| async move {
        Ok::<Bytes, Diagnostic>(invocation.payload)
    });
    Runtime::new(config).run(handler).await.unwrap();
    control_plane.await.unwrap();
}
