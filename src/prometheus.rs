//! The Prometheus scrape endpoint.
//!
//! A deliberately small synchronous HTTP server: one listener, one request
//! at a time, two possible paths. Scrapers either get the latest full cycle
//! as gauges or an explicit 503 when the last cycle produced nothing, never
//! stale data labeled as current.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context as _, Result};
use log::{debug, error, info, warn};
use socket2::{Domain, Protocol, Socket, Type};

use crate::store::{SharedState, Snapshot};

const BACKLOG: i32 = 10;
const MINIMUM_REQUEST_SIZE: usize = 16; // bytes
const REQUEST_BUFFER_SIZE: usize = 1024;

const SERVER_NAME: &str = "solar-exporter";
const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";
const METRICS_REQUEST: &[u8] = b"GET /metrics";

/// Binds the dual-stack listener on `[::]:port`. `SO_REUSEADDR` prevents
/// "Address already in use" when restarting the program too quickly.
fn bind(port: u16) -> Result<TcpListener> {
    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_only_v6(false)?;

    let address = SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, port));
    socket.bind(&address.into())?;
    socket.listen(BACKLOG)?;
    Ok(socket.into())
}

/// Serves `GET /metrics` until shutdown is requested. The accept call has no
/// timeout; the shutdown path unblocks it by shutting the registered
/// listener down.
pub fn run(port: u16, prefix: &str, state: &Arc<SharedState>) -> Result<()> {
    let listener = bind(port).with_context(|| format!("Cannot listen on [::]:{port}"))?;
    state.register_scrape_listener(Socket::from(listener.try_clone()?));
    info!("HTTP server listening on [::]:{port}...");

    while state.keep_running() {
        debug!("HTTP server waiting for request...");
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(e) = handle_client(stream, prefix, state) {
                    warn!("Request handling failed: {e}");
                }
            }
            Err(e) => {
                if state.keep_running() {
                    return Err(e).context("HTTP server could not accept request");
                }
                break;
            }
        }
    }

    info!("HTTP server stopped");
    Ok(())
}

/// Answers a single request. Anything that is not a `GET /metrics` of a
/// plausible length gets a 400; the connection is closed either way.
fn handle_client(mut stream: TcpStream, prefix: &str, state: &SharedState) -> Result<()> {
    debug!("HTTP server received request...");
    let started = Instant::now();

    let mut request = [0u8; REQUEST_BUFFER_SIZE];
    let received = stream.read(&mut request)?;

    let response = if received < MINIMUM_REQUEST_SIZE {
        warn!("Request too short (only {received} bytes)");
        bad_request()
    } else if request[..received].starts_with(METRICS_REQUEST) {
        metrics_response(prefix, &state.metrics.snapshot())
    } else {
        bad_request()
    };

    stream.write_all(response.as_bytes())?;
    info!(
        "HTTP server sent response ({} bytes) in {:.1?}",
        response.len(),
        started.elapsed()
    );
    Ok(())
}

fn bad_request() -> String {
    response("HTTP/1.1 400 Bad Request", "")
}

/// Renders the snapshot as gauges, or a 503 when the last cycle produced no
/// successful read at all.
fn metrics_response(prefix: &str, snapshot: &Snapshot) -> String {
    if snapshot.succeeded == 0 {
        error!("No metrics");
        return response(
            "HTTP/1.1 503 Service Unavailable",
            "503 Service Temporarily Unavailable\n",
        );
    }

    let mut body = String::new();
    for reading in &snapshot.readings {
        body.push_str(&format!(
            "# TYPE {prefix}_{name} gauge\n{prefix}_{name} {value:.6}\n",
            name = reading.name,
            value = reading.value,
        ));
    }
    response("HTTP/1.1 200 OK", &body)
}

fn response(status_line: &str, body: &str) -> String {
    format!(
        "{status_line}\r\n\
         Server: {SERVER_NAME}\r\n\
         Content-Length: {length}\r\n\
         Content-Type: {CONTENT_TYPE}\r\n\
         \r\n\
         {body}",
        length = body.len(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Reading;

    fn snapshot(readings: Vec<Reading>, succeeded: u64, failed: u64) -> Snapshot {
        Snapshot {
            readings,
            succeeded,
            failed,
        }
    }

    #[test]
    fn gauges_are_rendered_in_stored_order() {
        let snapshot = snapshot(
            vec![
                Reading { name: "pv1_watts", value: 100.0 },
                Reading { name: "battery_volts", value: 50.0 },
            ],
            2,
            0,
        );
        let response = metrics_response("growatt", &snapshot);

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Type: text/plain; version=0.0.4; charset=utf-8\r\n"));
        let body = response.split("\r\n\r\n").nth(1).unwrap();
        assert_eq!(
            body,
            "# TYPE growatt_pv1_watts gauge\n\
             growatt_pv1_watts 100.000000\n\
             # TYPE growatt_battery_volts gauge\n\
             growatt_battery_volts 50.000000\n"
        );
    }

    #[test]
    fn content_length_matches_the_body() {
        let snapshot = snapshot(vec![Reading { name: "battery_soc", value: 98.0 }], 1, 0);
        let response = metrics_response("epever", &snapshot);

        let body = response.split("\r\n\r\n").nth(1).unwrap();
        assert!(response.contains(&format!("Content-Length: {}\r\n", body.len())));
    }

    #[test]
    fn empty_cycle_is_served_as_unavailable() {
        let response = metrics_response("growatt", &snapshot(vec![], 0, 19));

        assert!(response.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        let body = response.split("\r\n\r\n").nth(1).unwrap();
        assert_eq!(body, "503 Service Temporarily Unavailable\n");
    }

    #[test]
    fn bad_request_carries_the_standard_headers() {
        let response = bad_request();
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(response.contains("Server: solar-exporter\r\n"));
        assert!(response.contains("Content-Length: 0\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    /// Runs one request against `handle_client` over a loopback socket pair.
    fn roundtrip(request: &[u8], state: &SharedState) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(address).unwrap();
        client.write_all(request).unwrap();
        client.shutdown(std::net::Shutdown::Write).unwrap();

        let (stream, _) = listener.accept().unwrap();
        handle_client(stream, "growatt", state).unwrap();

        let mut response = String::new();
        client.read_to_string(&mut response).unwrap();
        response
    }

    #[test]
    fn scrape_roundtrip_returns_the_latest_cycle() {
        let state = SharedState::new();
        state
            .metrics
            .replace(vec![Reading { name: "pv1_watts", value: 100.0 }], 1, 0);

        let response = roundtrip(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\n\r\n", &state);
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("growatt_pv1_watts 100.000000\n"));
    }

    #[test]
    fn short_request_is_rejected() {
        let state = SharedState::new();
        let response = roundtrip(b"HELLO\r\n\r\n", &state);
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn wrong_path_is_rejected() {
        let state = SharedState::new();
        state
            .metrics
            .replace(vec![Reading { name: "pv1_watts", value: 100.0 }], 1, 0);

        let response = roundtrip(b"GET /favicon.ico HTTP/1.1\r\n\r\n", &state);
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }
}
