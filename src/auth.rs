//! Delegated-auth plumbing: where the app was landed, how it navigates,
//! and the loopback listener that catches the login redirect.

use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use once_cell::sync::Lazy;
use tiny_http::{Header, Method, Response, Server};
use url::Url;

static HTML_SUCCESS: Lazy<String> = Lazy::new(|| page("Login complete", "Instafeed is now connected to your Instagram account. You can close this tab and return to the terminal."));

static HTML_FAILURE: Lazy<String> = Lazy::new(|| page("Login failed", "Instagram did not authorize Instafeed. Return to the terminal for details."));

fn page(title: &str, message: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>{title}</title>
    <style>
      body {{
        margin: 0;
        min-height: 100vh;
        display: flex;
        align-items: center;
        justify-content: center;
        background: #f3f4f6;
        color: #1f2937;
        font-family: "Inter", "Segoe UI", -apple-system, sans-serif;
      }}
      .card {{
        background: #fff;
        padding: 2.5rem 3rem;
        border-radius: 12px;
        box-shadow: 0 10px 30px rgba(0, 0, 0, 0.08);
        max-width: 480px;
        text-align: center;
      }}
    </style>
  </head>
  <body>
    <main class="card">
      <h1>{title}</h1>
      <p>{message}</p>
    </main>
  </body>
</html>"#
    )
}

/// The address the application is currently showing. Query parameters on it
/// carry the outcome of a delegated login.
pub trait Location {
    fn href(&self) -> Url;
    fn replace(&mut self, url: Url);
}

#[derive(Debug, Clone)]
pub struct MemoryLocation {
    url: Url,
}

impl MemoryLocation {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).with_context(|| format!("auth: parse location {raw}"))?;
        Ok(Self { url })
    }
}

impl Location for MemoryLocation {
    fn href(&self) -> Url {
        self.url.clone()
    }

    fn replace(&mut self, url: Url) {
        self.url = url;
    }
}

pub trait Navigator: Send + Sync {
    fn navigate(&self, url: &Url) -> Result<()>;
}

/// Opens URLs in the user's default browser.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl Navigator for SystemBrowser {
    fn navigate(&self, url: &Url) -> Result<()> {
        webbrowser::open(url.as_str())
            .with_context(|| format!("auth: open browser at {}", url))?;
        Ok(())
    }
}

/// Loopback HTTP listener waiting for the login backend to redirect the
/// browser back with `?token=` or `?error=`.
pub struct CallbackListener {
    pub redirect_uri: Url,
    rx: Receiver<Url>,
    shutdown: Sender<()>,
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

impl CallbackListener {
    pub fn bind(redirect_uri: &str) -> Result<Self> {
        let redirect = Url::parse(redirect_uri)
            .with_context(|| format!("auth: parse redirect uri {redirect_uri}"))?;

        let host = redirect.host_str().unwrap_or("127.0.0.1").to_string();
        let port = redirect.port().unwrap_or(0);
        let path = if redirect.path().is_empty() {
            "/".to_string()
        } else {
            redirect.path().to_string()
        };

        let listen_addr = format!("{}:{}", host, port);
        let server = Server::http(&listen_addr).map_err(|err| anyhow!("auth: listen: {}", err))?;
        let actual_addr = server.server_addr();
        let actual_redirect = Url::parse(&format!("http://{}{}", actual_addr, path))?;

        let (result_tx, result_rx) = bounded::<Url>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let origin = format!("http://{}", actual_addr);

        thread::spawn(move || loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }
            let request = match server.recv_timeout(Duration::from_millis(200)) {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(error = %err, "callback listener stopped");
                    break;
                }
            };
            if let Some(landed) = handle_redirect(request, &origin, &path) {
                let _ = result_tx.send(landed);
                break;
            }
        });

        tracing::debug!(redirect = %actual_redirect, "callback listener ready");
        Ok(Self {
            redirect_uri: actual_redirect,
            rx: result_rx,
            shutdown: shutdown_tx,
        })
    }

    /// Blocks until the browser lands on the redirect URI and returns the
    /// full landed URL, query included.
    pub fn wait(&self, timeout: Duration) -> Result<Url> {
        match self.rx.recv_timeout(timeout) {
            Ok(url) => Ok(url),
            Err(RecvTimeoutError::Timeout) => Err(anyhow!(
                "auth: no login callback within {}",
                humantime::format_duration(timeout)
            )),
            Err(RecvTimeoutError::Disconnected) => Err(anyhow!("auth: callback listener stopped")),
        }
    }
}

/// Answers one request. Returns the landed URL once a request carrying the
/// login outcome arrives; anything else is answered and ignored.
fn handle_redirect(req: tiny_http::Request, origin: &str, path: &str) -> Option<Url> {
    if req.method() != &Method::Get {
        let _ = req.respond(Response::from_string("method not allowed").with_status_code(405));
        return None;
    }

    let landed = match Url::parse(&format!("{}{}", origin, req.url())) {
        Ok(url) => url,
        Err(_) => {
            let _ = req.respond(Response::from_string("bad request").with_status_code(400));
            return None;
        }
    };
    if landed.path() != path {
        let _ = req.respond(Response::from_string("not found").with_status_code(404));
        return None;
    }

    let has = |name: &str| landed.query_pairs().any(|(key, _)| key == name);
    let body = if has("error") {
        HTML_FAILURE.clone()
    } else if has("token") {
        HTML_SUCCESS.clone()
    } else {
        let _ = req.respond(Response::from_string("login result missing").with_status_code(400));
        return None;
    };

    let mut response = Response::from_string(body);
    if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"text/html; charset=utf-8"[..]) {
        response = response.with_header(header);
    }
    let _ = req.respond(response);
    Some(landed)
}
