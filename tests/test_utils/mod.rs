//! Test utilities and fixtures for hostscope tests

#![allow(dead_code)]

use futures::stream::{self, BoxStream, StreamExt};
use hostscope::data::DiscoveredInstance;
use hostscope::discovery::{bounded, DiscoverySource, StopSignal};
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Discovery source that replays a script of `(delay_ms, instance)` steps.
///
/// Each delay is measured from the previous step. With `hang` set the stream
/// stays open after the script, so only the timeout or `stop()` ends it.
pub struct ScriptedSource {
    name: &'static str,
    script: Mutex<Vec<(u64, DiscoveredInstance)>>,
    hang: bool,
    stop: StopSignal,
    pub discover_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(name: &'static str, script: Vec<(u64, DiscoveredInstance)>) -> Self {
        Self {
            name,
            script: Mutex::new(script),
            hang: false,
            stop: StopSignal::new(),
            discover_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
        }
    }

    pub fn hanging(name: &'static str, script: Vec<(u64, DiscoveredInstance)>) -> Self {
        Self {
            hang: true,
            ..Self::new(name, script)
        }
    }

    /// Replace what the next `discover` call reports
    pub fn set_script(&self, script: Vec<(u64, DiscoveredInstance)>) {
        *self.script.lock().unwrap() = script;
    }

    pub fn discover_count(&self) -> usize {
        self.discover_calls.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

impl DiscoverySource for ScriptedSource {
    fn name(&self) -> &'static str {
        self.name
    }

    fn discover(&self, timeout: Duration) -> BoxStream<'static, DiscoveredInstance> {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().unwrap().clone();

        let steps = stream::iter(script).then(|(delay_ms, instance)| async move {
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            instance
        });

        let steps = if self.hang {
            steps.chain(stream::pending()).boxed()
        } else {
            steps.boxed()
        };

        bounded(steps, timeout, &self.stop)
    }

    fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.stop.trigger();
    }
}

pub fn network(port: u16) -> DiscoveredInstance {
    DiscoveredInstance::from_network("box.local.", port)
}

pub fn process(pid: u32, port: u16) -> DiscoveredInstance {
    DiscoveredInstance::from_process(pid, Some(port), None)
}

// ── HTTP test helpers ─────────────────────────────────────────────────────────

/// Serve a single raw HTTP response on an ephemeral port, after `delay`
pub fn serve_once_after(response: Vec<u8>, delay: Duration) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    std::thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf);
            std::thread::sleep(delay);
            let _ = stream.write_all(&response);
        }
    });
    port
}

pub fn serve_once(response: Vec<u8>) -> u16 {
    serve_once_after(response, Duration::ZERO)
}

/// Serve the same raw HTTP response to every connection on an ephemeral port
pub fn serve_always(response: Vec<u8>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    std::thread::spawn(move || {
        for mut stream in listener.incoming().flatten() {
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf);
            let _ = stream.write_all(&response);
        }
    });
    port
}

pub fn http_json(code: u16, reason: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {code} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

/// A port with nothing listening on it
pub fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr").port()
}
