//! Loopback fake of the fan device API for tests.

use flume::{Receiver, Sender};
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tiny_http::{Response, Server};

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub url: String,
    pub authorization: Option<String>,
}

pub struct FakeDevice {
    server: Arc<Server>,
    addr: SocketAddr,
    body: Arc<Mutex<String>>,
    requests: Receiver<RecordedRequest>,
}

impl FakeDevice {
    /// Serves `body` for every request until dropped.
    pub fn start(body: &str) -> Self {
        let server = Arc::new(Server::http("127.0.0.1:0").unwrap());
        let addr = server.server_addr().to_ip().unwrap();
        let body = Arc::new(Mutex::new(body.to_string()));
        let (tx, rx) = flume::unbounded();
        spawn_loop(server.clone(), body.clone(), tx);
        Self {
            server,
            addr,
            body,
            requests: rx,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_body(&self, body: &str) {
        *self.body.lock().unwrap() = body.to_string();
    }

    pub fn next_request(&self) -> Option<RecordedRequest> {
        self.requests.recv_timeout(Duration::from_secs(5)).ok()
    }

    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    pub fn drain(&self) -> Vec<RecordedRequest> {
        self.requests.drain().collect()
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.server.unblock();
    }
}

fn spawn_loop(server: Arc<Server>, body: Arc<Mutex<String>>, tx: Sender<RecordedRequest>) {
    thread::spawn(move || {
        for request in server.incoming_requests() {
            let authorization = request
                .headers()
                .iter()
                .find(|header| header.field.equiv("Authorization"))
                .map(|header| header.value.as_str().to_string());
            let recorded = RecordedRequest {
                method: request.method().to_string(),
                url: request.url().to_string(),
                authorization,
            };
            let reply = body.lock().unwrap().clone();
            // Record before replying so callers see the request once their call returns.
            let _ = tx.send(recorded);
            let _ = request.respond(Response::from_string(reply));
        }
    });
}

/// URL of a loopback port with nothing listening on it.
pub fn closed_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

/// A listener that completes connections but never answers. Keep the
/// returned listener alive for as long as the URL is used.
pub fn hanging_device() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    (listener, url)
}
