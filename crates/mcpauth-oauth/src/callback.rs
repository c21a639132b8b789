//! Loopback callback server.
//!
//! A short-lived HTTP listener on `127.0.0.1` that catches the browser
//! redirect carrying the authorization code. The first code delivered is
//! handed to the single [`CodeReceiver`] of the attempt; later deliveries are
//! rejected.

use crate::error::{OAuthError, OAuthResult};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// HTML response for a delivered authorization code.
const HTML_SUCCESS: &str = r#"<!DOCTYPE html>
<html>
<head>
  <title>mcpauth - Authorization Successful</title>
  <style>
    body { font-family: system-ui, -apple-system, sans-serif; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0; background: #1a1a2e; color: #eee; }
    .container { text-align: center; padding: 2rem; }
    h1 { color: #4ade80; margin-bottom: 1rem; }
    p { color: #aaa; }
  </style>
</head>
<body>
  <div class="container">
    <h1>Authorization Successful</h1>
    <p>You can close this window and return to the application.</p>
  </div>
  <script>setTimeout(() => window.close(), 2000);</script>
</body>
</html>"#;

/// HTML response for a callback that did not complete authorization.
fn html_error(error: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <title>mcpauth - Authorization Failed</title>
  <style>
    body {{ font-family: system-ui, -apple-system, sans-serif; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0; background: #1a1a2e; color: #eee; }}
    .container {{ text-align: center; padding: 2rem; }}
    h1 {{ color: #f87171; margin-bottom: 1rem; }}
    p {{ color: #aaa; }}
    .error {{ color: #fca5a5; font-family: monospace; margin-top: 1rem; padding: 1rem; background: rgba(248,113,113,0.1); border-radius: 0.5rem; }}
  </style>
</head>
<body>
  <div class="container">
    <h1>Authorization Failed</h1>
    <p>The authorization could not be completed.</p>
    <div class="error">{}</div>
  </div>
</body>
</html>"#,
        html_escape(error)
    )
}

/// Escape HTML special characters.
fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// Response written back to the browser.
#[derive(Debug, PartialEq, Eq)]
struct HttpResponse {
    status: u16,
    content_type: &'static str,
    body: String,
}

impl HttpResponse {
    fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: body.to_string(),
        }
    }

    fn html(status: u16, body: String) -> Self {
        Self {
            status,
            content_type: "text/html; charset=utf-8",
            body,
        }
    }

    fn to_http(&self) -> String {
        let status_text = match self.status {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            409 => "Conflict",
            500 => "Internal Server Error",
            _ => "Unknown",
        };

        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.status,
            status_text,
            self.content_type,
            self.body.len(),
            self.body
        )
    }
}

/// State shared between the accept loop and the server handle.
struct CallbackContext {
    callback_path: String,
    /// Single-slot rendezvous; emptied by the first delivered code.
    slot: Mutex<Option<oneshot::Sender<String>>>,
}

impl CallbackContext {
    /// Route a request target (path plus query) to a response.
    ///
    /// Errors are internal failures and become `500` responses.
    fn respond(&self, target: &str) -> Result<HttpResponse, String> {
        let path = target.split('?').next().unwrap_or_default();
        if !path.starts_with(&self.callback_path) {
            return Ok(HttpResponse::text(404, "Not Found"));
        }

        let url = url::Url::parse(&format!("http://127.0.0.1{target}"))
            .map_err(|e| format!("invalid callback URL {target}: {e}"))?;

        let mut code = None;
        let mut oauth_error = None;
        let mut error_description = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" if !value.is_empty() => code = Some(value.into_owned()),
                "error" => oauth_error = Some(value.into_owned()),
                "error_description" => error_description = Some(value.into_owned()),
                _ => {}
            }
        }

        debug!(
            has_code = code.is_some(),
            error = ?oauth_error,
            "Received OAuth callback"
        );

        let Some(code) = code else {
            let message = match (oauth_error, error_description) {
                (Some(err), Some(description)) => {
                    warn!(error = %err, description = %description, "Authorization server returned an error");
                    description
                }
                (Some(err), None) => {
                    warn!(error = %err, "Authorization server returned an error");
                    err
                }
                (None, _) => "No authorization code provided".to_string(),
            };
            return Ok(HttpResponse::html(400, html_error(&message)));
        };

        let sender = self
            .slot
            .lock()
            .map_err(|_| "callback state lock poisoned".to_string())?
            .take();

        let Some(sender) = sender else {
            warn!("Authorization code received after the flow already got one");
            return Ok(HttpResponse::html(
                409,
                html_error("This authorization has already been completed"),
            ));
        };

        if sender.send(code).is_err() {
            warn!("Authorization code received but nobody is waiting for it");
            return Ok(HttpResponse::html(
                409,
                html_error("No authorization is waiting for this callback"),
            ));
        }

        info!("Authorization code received");
        Ok(HttpResponse::html(200, HTML_SUCCESS.to_string()))
    }
}

/// Receives the authorization code of one attempt. Consumed on use.
pub struct CodeReceiver {
    rx: oneshot::Receiver<String>,
}

impl CodeReceiver {
    /// Wait for the code.
    ///
    /// Fails with [`OAuthError::Cancelled`] if the server is stopped first.
    pub async fn recv(self) -> OAuthResult<String> {
        self.rx.await.map_err(|_| OAuthError::Cancelled)
    }
}

/// Handle to a running callback server.
///
/// The port is released by [`CallbackServer::stop`]; dropping the handle
/// also signals the accept loop to exit.
pub struct CallbackServer {
    local_addr: SocketAddr,
    context: Arc<CallbackContext>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl CallbackServer {
    /// Bind `127.0.0.1:port` and start accepting callbacks on `callback_path`.
    ///
    /// Port `0` binds an ephemeral port; see [`CallbackServer::port`].
    pub async fn start(port: u16, callback_path: &str) -> OAuthResult<(Self, CodeReceiver)> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| OAuthError::ServerBind { port, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| OAuthError::ServerBind { port, source })?;

        info!(port = local_addr.port(), path = %callback_path, "OAuth callback server started");

        let (code_tx, code_rx) = oneshot::channel();
        let context = Arc::new(CallbackContext {
            callback_path: callback_path.to_string(),
            slot: Mutex::new(Some(code_tx)),
        });

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let loop_context = context.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _)) => {
                                let context = loop_context.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, context).await {
                                        warn!(error = %e, "Error handling OAuth callback");
                                    }
                                });
                            }
                            Err(e) => {
                                warn!(error = %e, "Error accepting connection");
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("OAuth callback server shutting down");
                        break;
                    }
                }
            }
        });

        let server = Self {
            local_addr,
            context,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            task: tokio::sync::Mutex::new(Some(task)),
        };
        Ok((server, CodeReceiver { rx: code_rx }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The bound port.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop accepting connections and release the port.
    ///
    /// Returns once the listener is closed. Calling it again is a no-op.
    pub async fn stop(&self) {
        self.signal_shutdown();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "OAuth callback server task failed");
            }
            debug!(port = self.port(), "OAuth callback server stopped");
        }
    }

    fn signal_shutdown(&self) {
        let sender = match self.shutdown_tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.signal_shutdown();
    }
}

/// Handle one HTTP connection: read the request line, route it, reply.
async fn handle_connection(mut stream: TcpStream, context: Arc<CallbackContext>) -> std::io::Result<()> {
    let mut buffer = [0u8; 8192];
    let mut n = 0;
    // The request line may span several reads.
    while n < buffer.len() && !buffer[..n].windows(2).any(|w| w == b"\r\n") {
        let read = stream.read(&mut buffer[n..]).await?;
        if read == 0 {
            break;
        }
        n += read;
    }
    let request = String::from_utf8_lossy(&buffer[..n]);

    let response = match request_target(&request) {
        Some(target) => match context.respond(target) {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "Error processing OAuth callback");
                HttpResponse::text(500, "Internal Server Error")
            }
        },
        None => HttpResponse::text(400, "Bad Request"),
    };

    stream.write_all(response.to_http().as_bytes()).await?;
    stream.shutdown().await.ok();
    Ok(())
}

/// Extract the origin-form target of a `GET` request line.
fn request_target(request: &str) -> Option<&str> {
    let first_line = request.lines().next()?;
    let mut parts = first_line.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    if method != "GET" || !target.starts_with('/') {
        return None;
    }
    Some(target)
}
