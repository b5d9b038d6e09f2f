//! Integration tests for the verifier
//!
//! Each test runs a loopback server thread that answers one connection per
//! canned response and records the request it received.

use cellverify::flow::{FlowError, ImApp};
use cellverify::net::{DefaultPath, FixedPathProvider, NetworkPathProvider, PathAvailability};
use cellverify::verify::{
    AuthRequest, AuthResult, CoverageRequest, FlowKind, LinkOpener, Verifier, VerifierConfig,
    VerifierConfigBuilder, VerifyError,
};
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const REDIRECT_URI: &str = "https://app.example/cb";

/// Log through the test writer; `RUST_LOG=cellverify=debug` shows flow traces
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Server {
    base: String,
    listener: TcpListener,
}

impl Server {
    fn bind() -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        Server { base, listener }
    }

    /// Answer one connection per response, returning the requests
    fn serve(self, responses: Vec<String>) -> thread::JoinHandle<Vec<String>> {
        thread::spawn(move || {
            let mut requests = Vec::new();
            for response in responses {
                let (mut stream, _) = self.listener.accept().unwrap();
                let mut buf = [0u8; 4096];
                let n = stream.read(&mut buf).unwrap();
                requests.push(String::from_utf8_lossy(&buf[..n]).into_owned());
                stream.write_all(response.as_bytes()).unwrap();
            }
            requests
        })
    }
}

fn config(base: &str) -> VerifierConfigBuilder {
    VerifierConfig::builder()
        .coverage_url(format!("{}/coverage", base))
        .auth_url(format!("{}/auth", base))
        .response_timeout(Duration::from_millis(500))
}

fn verifier(config: VerifierConfigBuilder) -> Verifier<FixedPathProvider> {
    Verifier::new(
        config.build().unwrap(),
        FixedPathProvider::new(Arc::new(DefaultPath)),
    )
}

fn auth_request() -> AuthRequest {
    AuthRequest::builder("C", REDIRECT_URI)
        .login_hint("381123456789")
        .state("S1")
        .build()
        .unwrap()
}

fn ok_json(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
}

fn found(location: &str, extra: &str) -> String {
    format!(
        "HTTP/1.1 302 Found\r\nLocation: {}\r\n{}Content-Length: 0\r\n\r\n",
        location, extra
    )
}

#[test]
fn test_coverage_available() {
    let server = Server::bind();
    let v = verifier(config(&server.base));
    let handle = server.serve(vec![ok_json(r#"{"available":true}"#)]);

    let report = v
        .check_coverage(&CoverageRequest::new("C", "381123456789"))
        .unwrap();
    assert!(report.available);
    assert!(report.raw.contains("\"available\":true"));

    let requests = handle.join().unwrap();
    assert!(requests[0].starts_with("GET /coverage?client_id=C&phone=381123456789 HTTP/1.1\r\n"));
    assert!(!v.is_in_progress(FlowKind::Coverage));
}

#[test]
fn test_coverage_not_supported() {
    let server = Server::bind();
    let v = verifier(config(&server.base));
    let handle = server.serve(vec![ok_json(r#"{"available":false}"#)]);

    let result = v.check_coverage(&CoverageRequest::new("C", "381123456789"));
    assert!(matches!(
        result,
        Err(VerifyError::Flow(FlowError::CoverageUnavailable(_)))
    ));
    handle.join().unwrap();
}

#[test]
fn test_auth_redirect_to_callback() {
    let server = Server::bind();
    let v = verifier(config(&server.base));
    let handle = server.serve(vec![found(
        "https://app.example/cb?code=XYZ&state=S1",
        "",
    )]);

    let success = v.authenticate(&auth_request()).unwrap();
    assert_eq!(success.redirect_url, "https://app.example/cb?code=XYZ&state=S1");
    assert_eq!(success.code.as_deref(), Some("XYZ"));
    assert_eq!(success.state, "S1");

    let requests = handle.join().unwrap();
    assert!(requests[0].starts_with("GET /auth?client_id=C&redirect_uri="));
    assert!(requests[0].contains("login_hint=381123456789"));
}

#[test]
fn test_redirect_chain_replays_cookies() {
    let server = Server::bind();
    let step2 = format!("{}/step2", server.base);
    let v = verifier(config(&server.base).sdk_header("ip-sdk-version", "0.1.0"));
    let handle = server.serve(vec![
        found(&step2, "Set-Cookie: sid=abc; Path=/; HttpOnly\r\n"),
        found("https://app.example/cb?code=XYZ&state=S1", ""),
    ]);

    let success = v.authenticate(&auth_request()).unwrap();
    assert_eq!(success.code.as_deref(), Some("XYZ"));

    let requests = handle.join().unwrap();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].contains("ip-sdk-version: 0.1.0\r\n"));
    assert!(!requests[0].contains("Cookie:"));
    assert!(requests[1].starts_with("GET /step2 HTTP/1.1\r\n"));
    assert!(requests[1].contains("Cookie: sid=abc;"));
}

#[test]
fn test_denied_authorization() {
    let server = Server::bind();
    let v = verifier(config(&server.base));
    let handle = server.serve(vec![found(
        "https://app.example/cb?error=access_denied&error_description=user%20denied&state=S1",
        "",
    )]);

    let result = v.authenticate(&auth_request());
    assert_eq!(
        result,
        Err(VerifyError::Flow(FlowError::AuthorizationFailed(
            "access_denied user denied".to_string()
        )))
    );
    handle.join().unwrap();
}

#[test]
fn test_hop_ceiling() {
    let server = Server::bind();
    let again = format!("{}/again", server.base);
    let v = verifier(config(&server.base).max_redirects(2));
    let handle = server.serve(vec![found(&again, ""), found(&again, ""), found(&again, "")]);

    let result = v.authenticate(&auth_request());
    assert_eq!(result, Err(VerifyError::Flow(FlowError::TooManyRedirects(2))));
    assert_eq!(handle.join().unwrap().len(), 3);
}

#[test]
fn test_server_error() {
    let server = Server::bind();
    let v = verifier(config(&server.base));
    let body = r#"{"error":"invalid_client","error_description":"unknown client"}"#;
    let handle = server.serve(vec![format!(
        "HTTP/1.1 400 Bad Request\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )]);

    match v.authenticate(&auth_request()) {
        Err(VerifyError::Flow(FlowError::ServerError { status, .. })) => assert_eq!(status, 400),
        other => panic!("unexpected result: {:?}", other),
    }
    handle.join().unwrap();
}

#[test]
fn test_silent_server_times_out() {
    let server = Server::bind();
    let v = verifier(config(&server.base).response_timeout(Duration::from_millis(200)));
    let listener = server.listener;
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 4096];
        let _ = stream.read(&mut buf);
        thread::sleep(Duration::from_millis(800));
    });

    let result = v.check_coverage(&CoverageRequest::new("C", "381123456789"));
    assert_eq!(result, Err(VerifyError::Flow(FlowError::Timeout)));
    handle.join().unwrap();
}

#[test]
fn test_cancel_and_reentrancy() {
    let server = Server::bind();
    let v = Arc::new(verifier(config(&server.base).response_timeout(Duration::from_secs(5))));
    let listener = server.listener;
    let (accepted_tx, accepted_rx) = mpsc::channel();
    let server_handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 4096];
        let _ = stream.read(&mut buf);
        accepted_tx.send(()).unwrap();
        // Hold the connection until the client goes away
        let _ = stream.read(&mut buf);
    });

    let flow_verifier = Arc::clone(&v);
    let flow = thread::spawn(move || flow_verifier.authenticate(&auth_request()));

    accepted_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(v.is_in_progress(FlowKind::Auth));
    assert_eq!(
        v.authenticate(&auth_request()),
        Err(VerifyError::AlreadyInProgress(FlowKind::Auth))
    );

    assert!(v.cancel(FlowKind::Auth));
    assert_eq!(flow.join().unwrap(), Err(VerifyError::Cancelled));
    assert!(!v.is_in_progress(FlowKind::Auth));
    assert!(!v.cancel(FlowKind::Auth));
    server_handle.join().unwrap();
}

struct FakeOpener {
    installed: Vec<ImApp>,
    opened: Mutex<Vec<(ImApp, String)>>,
}

impl FakeOpener {
    fn with(installed: Vec<ImApp>) -> Self {
        FakeOpener {
            installed,
            opened: Mutex::new(Vec::new()),
        }
    }
}

impl LinkOpener for FakeOpener {
    fn is_installed(&self, app: ImApp) -> bool {
        self.installed.contains(&app)
    }

    fn open(&self, app: ImApp, link: &str) -> Result<(), String> {
        self.opened.lock().unwrap().push((app, link.to_string()));
        Ok(())
    }
}

/// Handoff whose WhatsApp link points back at the server
fn im_handoff(base: &str) -> String {
    let wa_link = format!("{}/wa", base);
    let extra = format!(
        "imbox_session_id: s1\r\nwa_link: {}\r\ntelegram_link: tg://resolve?domain=bot\r\n",
        wa_link
    );
    found(&wa_link, &extra)
}

#[test]
fn test_im_handoff_opens_preferred_app() {
    let server = Server::bind();
    let v = verifier(config(&server.base));
    let handoff = im_handoff(&server.base);
    // The link is resolved with one more request before it is opened
    let handle = server.serve(vec![handoff, found("https://wa.me/123", "")]);
    let opener = FakeOpener::with(vec![ImApp::Telegram, ImApp::WhatsApp]);

    match v.authenticate_im(&auth_request(), &opener).unwrap() {
        AuthResult::LinkOpened {
            app,
            link,
            session,
            state,
        } => {
            assert_eq!(app, ImApp::WhatsApp);
            assert_eq!(link, "https://wa.me/123");
            assert_eq!(session.session_id, "s1");
            assert_eq!(state, "S1");
        }
        other => panic!("expected a handoff, got {:?}", other),
    }
    assert_eq!(
        *opener.opened.lock().unwrap(),
        vec![(ImApp::WhatsApp, "https://wa.me/123".to_string())]
    );

    let requests = handle.join().unwrap();
    // No channel on the request, so the configured priority is offered
    assert!(requests[0].contains("&channel=wa%20telegram%20viber"));
    assert!(requests[1].starts_with("GET /wa HTTP/1.1\r\n"));
}

#[test]
fn test_im_link_used_as_given_when_resolution_disabled() {
    let server = Server::bind();
    let v = verifier(config(&server.base).resolve_im_links(false));
    let handoff = im_handoff(&server.base);
    let wa_link = format!("{}/wa", server.base);
    let handle = server.serve(vec![handoff]);
    let opener = FakeOpener::with(vec![ImApp::WhatsApp]);

    let request = AuthRequest::builder("C", REDIRECT_URI)
        .login_hint("381123456789")
        .state("S1")
        .channel(&[ImApp::WhatsApp])
        .build()
        .unwrap();
    match v.authenticate_im(&request, &opener).unwrap() {
        AuthResult::LinkOpened { link, .. } => assert_eq!(link, wa_link),
        other => panic!("expected a handoff, got {:?}", other),
    }

    let requests = handle.join().unwrap();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].contains("&channel=wa "));
}

#[test]
fn test_im_handoff_without_installed_app() {
    let server = Server::bind();
    let v = verifier(config(&server.base));
    let handoff = im_handoff(&server.base);
    let handle = server.serve(vec![handoff]);
    let opener = FakeOpener::with(vec![ImApp::Viber]);

    assert_eq!(
        v.authenticate_im(&auth_request(), &opener),
        Err(VerifyError::NoSupportedImApp)
    );
    assert!(opener.opened.lock().unwrap().is_empty());
    handle.join().unwrap();
}

#[test]
fn test_verify_checks_coverage_then_authorizes() {
    let server = Server::bind();
    let v = verifier(config(&server.base));
    let handle = server.serve(vec![
        ok_json(r#"{"available":true}"#),
        found("https://app.example/cb?code=XYZ&state=S1", ""),
    ]);

    let success = v
        .verify(&CoverageRequest::new("C", "381123456789"), &auth_request())
        .unwrap();
    assert_eq!(success.code.as_deref(), Some("XYZ"));

    let requests = handle.join().unwrap();
    assert!(requests[0].starts_with("GET /coverage?"));
    assert!(requests[1].starts_with("GET /auth?"));
}

struct SlowProvider;

impl NetworkPathProvider for SlowProvider {
    fn acquire(&self, _timeout: Duration) -> PathAvailability {
        PathAvailability::Timeout
    }
}

#[test]
fn test_path_provider_failures() {
    let config = config("http://127.0.0.1:9").build().unwrap();

    let unavailable = Verifier::new(config.clone(), FixedPathProvider::unavailable());
    assert_eq!(
        unavailable.authenticate(&auth_request()),
        Err(VerifyError::NetworkUnavailable)
    );

    let slow = Verifier::new(config, SlowProvider);
    let err = slow.authenticate(&auth_request()).unwrap_err();
    assert_eq!(err, VerifyError::NetworkTimeout);
    assert_eq!(err.to_string(), "Failed to request network. Timeout error");
}
