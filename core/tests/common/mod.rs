#![allow(dead_code)]
//! Shared integration test utilities.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Once;
use std::thread;
use std::time::Duration;

use fixture_server::AppState;

static INIT_LOGGING: Once = Once::new();

/// Install a test-writer tracing subscriber once per test binary.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("transfer_core=debug")),
            )
            .with_test_writer()
            .with_target(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Start the fixture server on a random port. Returns its base URL and the
/// state shared with its handlers.
pub fn spawn_fixture_server() -> (String, AppState) {
    let std_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    std_listener.set_nonblocking(true).unwrap();

    let state = AppState::default();
    let server_state = state.clone();
    thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
            fixture_server::run_with_state(listener, server_state).await
        })
        .unwrap();
    });

    (format!("http://{addr}"), state)
}

/// One step of a scripted raw-socket response.
#[derive(Debug, Clone)]
pub enum Step {
    Send(Vec<u8>),
    Pause(Duration),
}

pub fn send(bytes: &[u8]) -> Step {
    Step::Send(bytes.to_vec())
}

pub fn pause(ms: u64) -> Step {
    Step::Pause(Duration::from_millis(ms))
}

/// Serve exactly one connection: read the request head, play `steps`, then
/// close. The join handle yields the raw request bytes.
pub fn serve_script(steps: Vec<Step>) -> (String, thread::JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://127.0.0.1:{}/scripted", listener.local_addr().unwrap().port());
    let handle = thread::spawn(move || {
        let (mut socket, _) = listener.accept().unwrap();
        let request = read_head(&mut socket);
        for step in steps {
            match step {
                Step::Send(bytes) => {
                    // The client may hang up early; later writes can fail.
                    if socket.write_all(&bytes).is_err() {
                        break;
                    }
                    let _ = socket.flush();
                }
                Step::Pause(duration) => thread::sleep(duration),
            }
        }
        request
    });
    (url, handle)
}

fn read_head(socket: &mut impl Read) -> Vec<u8> {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
    }
    request
}
