//! Inbound webhook server through which the device pushes state changes.
//!
//! Accepts `/<name>?value=<v>` and `/<name>/<v>`. Every reply is a 200;
//! the body tells the device whether the name was recognized.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tiny_http::{Response, Server};
use tracing::{debug, info, warn};

use crate::accessory::FanAccessory;
use crate::characteristic::Characteristic;
use crate::error::{Error, Result};

pub const ACCEPTED: &str = "Handling request";
pub const REJECTED: &str = "Invalid request";

/// Splits a request URL into a characteristic name and its value.
pub fn parse_push(url: &str) -> (String, Option<String>) {
    let (path, query) = url.split_once('?').unwrap_or((url, ""));
    let path = path.trim_start_matches('/');
    let (name, segment) = match path.split_once('/') {
        Some((name, segment)) => (name, Some(segment.trim_end_matches('/'))),
        None => (path, None),
    };
    let value = match segment.filter(|segment| !segment.is_empty()) {
        Some(segment) => Some(decode(segment)),
        None => query_value(query),
    };
    (decode(name), value)
}

// Query strings are form-encoded: `+` is a space and keys may be escaped too.
fn query_value(query: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| decode_form(key) == "value")
        .map(|(_, value)| decode_form(value))
}

fn decode(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|value| value.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

fn decode_form(raw: &str) -> String {
    decode(&raw.replace('+', " "))
}

/// A running webhook listener bound to one accessory.
pub struct Listener {
    server: Arc<Server>,
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl Listener {
    /// Binds the accessory's configured port on all interfaces.
    pub fn start(accessory: FanAccessory) -> Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], accessory.config().listener_port()));
        Self::bind(accessory, addr)
    }

    pub fn bind(accessory: FanAccessory, addr: SocketAddr) -> Result<Self> {
        let server = Server::http(addr).map_err(|err| Error::Bind {
            addr,
            message: err.to_string(),
        })?;
        let server = Arc::new(server);
        let addr = server.server_addr().to_ip().unwrap_or(addr);
        info!(accessory = %accessory.name(), "Listen server: http://{addr}");

        let worker = server.clone();
        let handle = thread::Builder::new()
            .name(format!("listen-{}", accessory.name()))
            .spawn(move || serve(&worker, &accessory))?;
        Ok(Self {
            server,
            addr,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(self) {
        self.server.unblock();
        let _ = self.handle.join();
    }

    pub fn join(self) {
        let _ = self.handle.join();
    }
}

fn serve(server: &Server, accessory: &FanAccessory) {
    for request in server.incoming_requests() {
        let url = request.url().to_string();
        let (name, value) = parse_push(&url);
        match Characteristic::from_push_name(&name) {
            Some(characteristic) => {
                debug!(accessory = %accessory.name(), %url, "Handling request");
                if let Err(err) = request.respond(Response::from_string(ACCEPTED)) {
                    warn!(accessory = %accessory.name(), error = %err, "failed to reply");
                }
                // Errors are logged by the accessory and never reach the device.
                let _ = accessory.apply_push(characteristic, value.as_deref());
            }
            None => {
                warn!(accessory = %accessory.name(), %url, "Invalid request");
                if let Err(err) = request.respond(Response::from_string(REJECTED)) {
                    warn!(accessory = %accessory.name(), error = %err, "failed to reply");
                }
            }
        }
    }
    debug!(accessory = %accessory.name(), "listener stopped");
}
