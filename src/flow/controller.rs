//! Flow controller
//!
//! Drives connection attempts over the selected network path, follows
//! redirect hops with the flow's cookies and settles the flow exactly once.

use super::attempt::{Attempt, AttemptEnd, Event};
use super::classify::{classify, ClassifyContext};
use super::{CancelToken, FlowError, FlowOutcome, RequestKind};
use crate::cookies::CookieStore;
use crate::http::tls::{TlsConfig, TlsError, TlsVersion};
use crate::http::{self, build_request, escape_query, Endpoint, Headers, ParsedResponse};
use crate::net::{is_network_down, Connection, DefaultPath, NetworkPath, Transport};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Engine settings shared by every flow of a controller
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Bound on TCP connect and TLS handshake
    pub connect_timeout: Duration,
    /// Wait for the first response byte, measured from connect-ready;
    /// once data flows, the longest pause between chunks
    pub response_timeout: Duration,
    /// Redirect hops followed before failing with `TooManyRedirects`
    pub max_redirects: usize,
    pub verify_peer: bool,
    /// Extra trust roots
    pub ca_file: Option<PathBuf>,
    pub min_tls_version: TlsVersion,
    /// Headers sent to the host of the first request only
    pub extra_headers: Headers,
}

impl Default for FlowConfig {
    fn default() -> Self {
        FlowConfig {
            connect_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(10),
            max_redirects: 10,
            verify_peer: true,
            ca_file: None,
            min_tls_version: TlsVersion::Tls12,
            extra_headers: Headers::new(),
        }
    }
}

impl FlowConfig {
    fn tls_config(&self) -> Result<TlsConfig, TlsError> {
        let mut builder = TlsConfig::client()?
            .version_range(self.min_tls_version, TlsVersion::Tls13)?
            .verify_peer(self.verify_peer);
        if let Some(ca_file) = &self.ca_file {
            builder = builder.ca_file(ca_file)?;
        }
        builder.build()
    }
}

/// One flow to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRequest {
    pub url: String,
    pub kind: RequestKind,
    /// Registered redirect URI; empty for coverage flows
    pub redirect_uri: String,
    pub im_mode: bool,
}

impl FlowRequest {
    pub fn coverage(url: impl Into<String>) -> Self {
        FlowRequest {
            url: url.into(),
            kind: RequestKind::Coverage,
            redirect_uri: String::new(),
            im_mode: false,
        }
    }

    pub fn auth(url: impl Into<String>, redirect_uri: impl Into<String>) -> Self {
        FlowRequest {
            url: url.into(),
            kind: RequestKind::Auth,
            redirect_uri: redirect_uri.into(),
            im_mode: false,
        }
    }

    /// Treat `imbox_session_id` responses as IM handoffs
    pub fn im_mode(mut self, enabled: bool) -> Self {
        self.im_mode = enabled;
        self
    }
}

/// Runs flows over one network path
#[derive(Clone)]
pub struct FlowController {
    config: FlowConfig,
    tls: TlsConfig,
    path: Arc<dyn NetworkPath>,
}

impl FlowController {
    pub fn new(config: FlowConfig, path: Arc<dyn NetworkPath>) -> Result<Self, TlsError> {
        let tls = config.tls_config()?;
        Ok(FlowController { config, tls, path })
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn path(&self) -> &Arc<dyn NetworkPath> {
        &self.path
    }

    /// Run a flow to its end on the calling thread
    ///
    /// Returns the terminal outcome, or `None` when the flow was cancelled
    /// first. `ContinueRedirect` is never returned.
    pub fn run(&self, request: &FlowRequest, token: &CancelToken) -> Option<FlowOutcome> {
        let mut cookies = CookieStore::new();
        let mut url = request.url.clone();
        let mut kind = request.kind;
        let mut hops = 0;
        let first_host = Endpoint::parse(&url).ok().map(|e| e.host().to_string());

        tracing::info!("starting {:?} flow at {}", kind, url);

        loop {
            if token.is_cancelled() {
                return None;
            }

            let ctx = ClassifyContext {
                kind,
                redirect_uri: &request.redirect_uri,
                im_mode: request.im_mode,
            };
            let outcome = self.hop(&url, &ctx, first_host.as_deref(), &mut cookies, token)?;

            match outcome {
                FlowOutcome::ContinueRedirect(next) => {
                    hops += 1;
                    if hops > self.config.max_redirects {
                        tracing::warn!("giving up after {} redirects", self.config.max_redirects);
                        return settle(
                            token,
                            FlowOutcome::Failure(FlowError::TooManyRedirects(
                                self.config.max_redirects,
                            )),
                        );
                    }
                    url = escape_query(&next);
                    if kind == RequestKind::Auth {
                        kind = RequestKind::Redirect;
                    }
                    tracing::debug!("redirect hop {} to {}", hops, url);
                }
                terminal => return settle(token, terminal),
            }
        }
    }

    /// Run a flow on its own thread
    pub fn spawn(&self, request: FlowRequest) -> FlowHandle {
        self.spawn_with_token(request, CancelToken::new())
    }

    /// Run a flow on its own thread, cancelled through `token`
    pub fn spawn_with_token(&self, request: FlowRequest, token: CancelToken) -> FlowHandle {
        let (tx, rx) = mpsc::sync_channel(1);
        let controller = self.clone();
        let flow_token = token.clone();

        let join = thread::spawn(move || {
            if let Some(outcome) = controller.run(&request, &flow_token) {
                let _ = tx.send(outcome);
            }
        });

        FlowHandle {
            token,
            rx,
            join: Some(join),
        }
    }

    /// One plain GET that does not follow redirects
    ///
    /// Uses the default route rather than the flow's path. Used to resolve
    /// IM links.
    pub fn fetch_once(&self, url: &str) -> Result<ParsedResponse, FlowError> {
        let endpoint = Endpoint::parse(url)
            .map_err(|e| FlowError::InvalidRedirectTarget(e.to_string()))?;
        let token = CancelToken::new();
        let mut conn = Transport::open(
            &endpoint,
            &DefaultPath,
            &self.tls,
            self.config.connect_timeout,
            &token,
        )?;
        let frame = build_request(&endpoint, "", &Headers::new());

        match drive(&mut conn, &frame, &token, self.config.response_timeout) {
            AttemptEnd::Response(response) => Ok(response),
            AttemptEnd::Failed(err) => Err(err),
            AttemptEnd::Cancelled => Err(FlowError::Disconnected),
        }
    }

    /// One connection attempt and its classification
    ///
    /// `None` means the flow was cancelled.
    fn hop(
        &self,
        url: &str,
        ctx: &ClassifyContext<'_>,
        first_host: Option<&str>,
        cookies: &mut CookieStore,
        token: &CancelToken,
    ) -> Option<FlowOutcome> {
        let endpoint = match Endpoint::parse(url) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                return Some(FlowOutcome::Failure(FlowError::InvalidRedirectTarget(
                    e.to_string(),
                )))
            }
        };

        let mut conn = match Transport::open(
            &endpoint,
            self.path.as_ref(),
            &self.tls,
            self.config.connect_timeout,
            token,
        ) {
            Ok(conn) => conn,
            Err(_) if token.is_cancelled() => {
                token.detach();
                return None;
            }
            Err(e) => {
                token.detach();
                tracing::warn!("cannot open {}: {}", endpoint, e);
                return Some(FlowOutcome::Failure(e.into()));
            }
        };
        if token.is_cancelled() {
            return None;
        }

        let cookie_line = cookies.render(endpoint.host(), endpoint.path());
        let empty = Headers::new();
        let extra = if first_host == Some(endpoint.host()) {
            &self.config.extra_headers
        } else {
            &empty
        };
        let frame = build_request(&endpoint, &cookie_line, extra);
        tracing::debug!("GET {} ({} cookie bytes)", endpoint, cookie_line.len());

        let end = drive(&mut conn, &frame, token, self.config.response_timeout);
        conn.close();

        match end {
            AttemptEnd::Cancelled => None,
            AttemptEnd::Failed(err) => {
                tracing::debug!("attempt to {} failed: {}", endpoint, err);
                Some(FlowOutcome::Failure(err))
            }
            AttemptEnd::Response(response) => {
                tracing::debug!("{} answered {}", endpoint, response.status());
                cookies.absorb_response(response.headers(), endpoint.host());
                Some(classify(&response, ctx))
            }
        }
    }
}

/// Feed one connection's activity through an attempt until it ends
fn drive(
    conn: &mut Connection,
    frame: &[u8],
    token: &CancelToken,
    timeout: Duration,
) -> AttemptEnd {
    let mut attempt = Attempt::new();
    // First-byte deadline runs from connect-ready
    let deadline = Instant::now() + timeout;

    match conn.shutdown_handle() {
        Ok(handle) => token.attach(handle),
        Err(e) => tracing::debug!("no shutdown handle for {}: {}", conn.endpoint(), e),
    }

    let end = run_attempt(conn, &mut attempt, frame, token, deadline, timeout);
    token.detach();
    end
}

fn run_attempt(
    conn: &mut Connection,
    attempt: &mut Attempt,
    frame: &[u8],
    token: &CancelToken,
    deadline: Instant,
    timeout: Duration,
) -> AttemptEnd {
    let sent = match conn.write(frame) {
        Ok(()) => Event::Sent,
        Err(e) => failure_event(e, Event::SendFailed),
    };

    for event in [Event::Ready, sent] {
        if let Some(end) = deliver(attempt, token, event) {
            return end;
        }
    }

    let mut buf = [0u8; http::READ_CHUNK_SIZE];
    loop {
        let wait = if attempt.has_received_data() {
            timeout
        } else {
            deadline.saturating_duration_since(Instant::now())
        };

        let event = match conn.read(&mut buf, Some(wait)) {
            Ok(0) => Event::Closed,
            Ok(n) => Event::Data(buf[..n].to_vec()),
            Err(http::Error::Timeout) => Event::TimedOut,
            Err(e) => failure_event(e, Event::ReadFailed),
        };

        if let Some(end) = deliver(attempt, token, event) {
            return end;
        }
    }
}

/// Hand an event to the attempt, unless the flow was cancelled meanwhile
fn deliver(attempt: &mut Attempt, token: &CancelToken, event: Event) -> Option<AttemptEnd> {
    let event = if token.is_cancelled() {
        Event::Cancelled
    } else {
        event
    };
    attempt.handle(event)
}

fn failure_event(err: http::Error, wrap: fn(String) -> Event) -> Event {
    match &err {
        http::Error::Io(io) if is_network_down(io) => Event::NetworkDown,
        _ => wrap(err.to_string()),
    }
}

fn settle(token: &CancelToken, outcome: FlowOutcome) -> Option<FlowOutcome> {
    if token.claim_terminal() {
        tracing::info!("flow finished: {:?}", outcome);
        Some(outcome)
    } else {
        tracing::debug!("dropping outcome of a settled flow");
        None
    }
}

/// A flow running on its own thread
pub struct FlowHandle {
    token: CancelToken,
    rx: mpsc::Receiver<FlowOutcome>,
    join: Option<JoinHandle<()>>,
}

impl FlowHandle {
    /// Cancel the flow; returns false when it had already settled
    pub fn cancel(&self) -> bool {
        self.token.cancel()
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Wait for the terminal outcome; `None` when the flow was cancelled
    pub fn wait(mut self) -> Option<FlowOutcome> {
        let outcome = self.rx.recv().ok();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                tracing::error!("flow thread panicked");
            }
        }
        outcome
    }

    /// Like `wait`, giving up after `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> Option<FlowOutcome> {
        self.rx.recv_timeout(timeout).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn controller() -> FlowController {
        let config = FlowConfig {
            response_timeout: Duration::from_millis(300),
            ..FlowConfig::default()
        };
        FlowController::new(config, Arc::new(DefaultPath)).unwrap()
    }

    /// Serve canned responses, one connection each, returning the requests
    fn serve(responses: Vec<String>) -> (String, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let mut requests = Vec::new();
            for response in responses {
                let (mut stream, _) = listener.accept().unwrap();
                let mut buf = [0u8; 4096];
                let n = stream.read(&mut buf).unwrap();
                requests.push(String::from_utf8_lossy(&buf[..n]).into_owned());
                stream.write_all(response.as_bytes()).unwrap();
            }
            requests
        });
        (base, handle)
    }

    #[test]
    fn test_run_coverage() {
        let (base, server) = serve(vec![
            "HTTP/1.1 200 OK\r\nContent-Length: 18\r\n\r\n{\"available\":true}".to_string(),
        ]);
        let request = FlowRequest::coverage(format!("{}/coverage?client_id=C&phone=P", base));
        let outcome = controller().run(&request, &CancelToken::new());

        assert_eq!(
            outcome,
            Some(FlowOutcome::CoverageResult {
                available: true,
                raw: "{\"available\":true}".to_string()
            })
        );
        let requests = server.join().unwrap();
        assert!(requests[0].starts_with("GET /coverage?client_id=C&phone=P HTTP/1.1\r\n"));
    }

    #[test]
    fn test_many_cookies_keep_location() {
        let mut reply = String::from("HTTP/1.1 302 Found\r\n");
        for i in 0..70 {
            reply.push_str(&format!("Set-Cookie: c{}=v{}; Path=/\r\n", i, i));
        }
        reply.push_str("Location: https://app.example/cb?code=XYZ\r\nContent-Length: 0\r\n\r\n");
        let (base, server) = serve(vec![reply]);

        let request = FlowRequest::auth(format!("{}/auth", base), "https://app.example/cb");
        let outcome = controller().run(&request, &CancelToken::new());
        assert_eq!(
            outcome,
            Some(FlowOutcome::Success("https://app.example/cb?code=XYZ".to_string()))
        );
        server.join().unwrap();
    }

    #[test]
    fn test_redirect_then_boundary() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let next = format!("{}/step2", base);
        let server = thread::spawn(move || {
            let replies = [
                format!(
                    "HTTP/1.1 302 Found\r\nLocation: {}\r\nSet-Cookie: sid=abc; Path=/\r\n\r\n",
                    next
                ),
                "HTTP/1.1 302 Found\r\nLocation: https://app.example/cb?code=XYZ&state=S1\r\n\r\n"
                    .to_string(),
            ];
            let mut requests = Vec::new();
            for reply in replies {
                let (mut stream, _) = listener.accept().unwrap();
                let mut buf = [0u8; 4096];
                let n = stream.read(&mut buf).unwrap();
                requests.push(String::from_utf8_lossy(&buf[..n]).into_owned());
                stream.write_all(reply.as_bytes()).unwrap();
            }
            requests
        });

        let request = FlowRequest::auth(format!("{}/auth", base), "https://app.example/cb");
        let outcome = controller().run(&request, &CancelToken::new());
        assert_eq!(
            outcome,
            Some(FlowOutcome::Success(
                "https://app.example/cb?code=XYZ&state=S1".to_string()
            ))
        );

        let requests = server.join().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(!requests[0].contains("Cookie:"));
        assert!(requests[1].starts_with("GET /step2 HTTP/1.1\r\n"));
        assert!(requests[1].contains("Cookie: sid=abc; \r\n"));
    }

    #[test]
    fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(800));
            drop(stream);
        });

        let token = CancelToken::new();
        let outcome = controller().run(&FlowRequest::coverage(format!("{}/c", base)), &token);
        assert_eq!(outcome, Some(FlowOutcome::Failure(FlowError::Timeout)));
        assert!(token.is_settled());
        assert!(!token.cancel());
        server.join().unwrap();
    }

    #[test]
    fn test_cancel_spawned_flow() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(200));
            // Late data after the cancel
            let _ = stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n{\"available\":true}");
        });

        let config = FlowConfig {
            response_timeout: Duration::from_secs(5),
            ..FlowConfig::default()
        };
        let controller = FlowController::new(config, Arc::new(DefaultPath)).unwrap();
        let handle = controller.spawn(FlowRequest::coverage(format!("{}/c", base)));
        thread::sleep(Duration::from_millis(50));

        assert!(handle.cancel());
        assert_eq!(handle.wait(), None);
        server.join().unwrap();
    }

    #[test]
    fn test_cancel_during_connect() {
        let config = FlowConfig {
            connect_timeout: Duration::from_secs(10),
            ..FlowConfig::default()
        };
        let controller = FlowController::new(config, Arc::new(DefaultPath)).unwrap();
        // Unroutable; the connect stays pending unless the host rejects it outright
        let handle = controller.spawn(FlowRequest::coverage("http://10.255.255.1:81/c"));
        thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        let cancelled = handle.cancel();
        let outcome = handle.wait();
        assert!(start.elapsed() < Duration::from_secs(2));
        if cancelled {
            assert_eq!(outcome, None);
        }
    }

    #[test]
    fn test_ipv6_loopback_flow() {
        // Hosts without IPv6 loopback have nothing to test against
        let Ok(listener) = TcpListener::bind("[::1]:0") else {
            return;
        };
        let base = format!("http://[::1]:{}", listener.local_addr().unwrap().port());
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            let n = stream.read(&mut buf).unwrap();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 18\r\n\r\n{\"available\":true}")
                .unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });

        let request = FlowRequest::coverage(format!("{}/c", base));
        let outcome = controller().run(&request, &CancelToken::new());
        assert!(matches!(
            outcome,
            Some(FlowOutcome::CoverageResult { available: true, .. })
        ));
        assert!(server.join().unwrap().contains("Host: [::1]\r\n"));
    }

    #[test]
    fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let outcome = controller().run(&FlowRequest::coverage(base), &CancelToken::new());
        assert!(matches!(
            outcome,
            Some(FlowOutcome::Failure(FlowError::ConnectFailed(_)))
        ));
    }

    #[test]
    fn test_fetch_once() {
        let (base, server) = serve(vec![
            "HTTP/1.1 302 Found\r\nLocation: https://wa.me/123\r\n\r\n".to_string(),
        ]);
        let response = controller().fetch_once(&format!("{}/im/link", base)).unwrap();
        assert_eq!(response.location(), Some("https://wa.me/123"));
        server.join().unwrap();
    }
}
