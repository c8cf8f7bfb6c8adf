//! Git action endpoint
//!
//! `POST <base_path>/_git` stops the backend, runs a git action against the
//! site repository, then redirects back. The next request boots a fresh
//! backend that sees the new working tree.

use crate::config::Config;
use crate::error::SupervisorError;
use crate::process::Supervisor;
use anyhow::{Context, Result};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::HeaderValue;
use hyper::{Request, Response, StatusCode, Uri};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error, info};

/// Path of the git endpoint below the backend base path
pub const GIT_ACTION_PATH: &str = "/_git";

pub type GitFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Performs a git action described by a submitted form
pub trait GitHandler: Send + Sync {
    fn handle<'a>(&'a self, form: &'a [(String, String)]) -> GitFuture<'a>;
}

/// Runs the `git` executable in the repository directory.
///
/// The form's `action` field selects what to do:
/// - `commit`: stage everything and commit with the `message` field
/// - `push` / `pull`
/// - `sync`: `pull --rebase` followed by `push`
pub struct CommandGitHandler {
    command: String,
    working_dir: Option<PathBuf>,
}

impl CommandGitHandler {
    pub fn new(command: impl Into<String>, working_dir: Option<PathBuf>) -> Self {
        Self {
            command: command.into(),
            working_dir,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.git.command.clone(), config.git_dir())
    }

    async fn git(&self, args: &[&str]) -> Result<()> {
        let mut cmd = Command::new(&self.command);
        cmd.args(args).stdin(Stdio::null());
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to run {} {}", self.command, args.join(" ")))?;

        if !output.status.success() {
            anyhow::bail!(
                "{} {} failed ({}): {}",
                self.command,
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        debug!(args = %args.join(" "), "Git command succeeded");
        Ok(())
    }

    async fn run(&self, form: &[(String, String)]) -> Result<()> {
        let action = form_value(form, "action").context("Missing 'action' field")?;
        info!(action, "Running git action");

        match action {
            "commit" => {
                let message = form_value(form, "message")
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .unwrap_or("Update content");
                self.git(&["add", "-A"]).await?;
                self.git(&["commit", "-m", message]).await
            }
            "push" => self.git(&["push"]).await,
            "pull" => self.git(&["pull"]).await,
            "sync" => {
                self.git(&["pull", "--rebase"]).await?;
                self.git(&["push"]).await
            }
            other => anyhow::bail!("Unknown git action '{}'", other),
        }
    }
}

impl GitHandler for CommandGitHandler {
    fn handle<'a>(&'a self, form: &'a [(String, String)]) -> GitFuture<'a> {
        Box::pin(self.run(form))
    }
}

/// Stop the backend, run the action, then redirect.
///
/// The redirect target is the `redirect` query parameter, or the public
/// origin followed by the base path. Failures answer `500` with the error
/// rendered as plain text.
pub async fn handle_git_action<B>(
    req: Request<B>,
    supervisor: &Supervisor,
    handler: &dyn GitHandler,
) -> Response<BoxBody<Bytes, hyper::Error>>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let base_path = supervisor.config().base_path.clone();
    let fallback = format!("{}{}", public_origin(&req), base_path);
    let location = query_param(req.uri(), "redirect")
        .filter(|r| !r.is_empty())
        .unwrap_or(fallback);

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, "Failed to read git form");
            return text_response(StatusCode::BAD_REQUEST, format!("Failed to read form: {}", e));
        }
    };
    let form = parse_form(&body);

    // The backend must not hold the working tree while git rewrites it
    supervisor.stop().await;

    match handler.handle(&form).await {
        Ok(()) => {
            let location = HeaderValue::from_str(&location)
                .unwrap_or_else(|_| HeaderValue::from_str(&base_path).unwrap_or(HeaderValue::from_static("/")));
            info!(location = ?location, "Git action done, redirecting");
            Response::builder()
                .status(StatusCode::SEE_OTHER)
                .header(hyper::header::LOCATION, location)
                .body(Full::new(Bytes::new()).map_err(|never| match never {}).boxed())
                .expect("valid response builder")
        }
        Err(e) => {
            let failure = SupervisorError::ExternalActionFailure(format!("{:#}", e));
            error!(error = %failure, "Git action failed");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{:?}", e))
        }
    }
}

fn text_response(status: StatusCode, body: String) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

/// `scheme://host` as the client addressed the proxy
fn public_origin<B>(req: &Request<B>) -> String {
    let headers = req.headers();
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .unwrap_or("localhost");
    format!("{}://{}", proto, host)
}

/// Decode an `application/x-www-form-urlencoded` body
pub fn parse_form(body: &[u8]) -> Vec<(String, String)> {
    parse_pairs(&String::from_utf8_lossy(body))
}

fn parse_pairs(input: &str) -> Vec<(String, String)> {
    input
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced.clone(),
    }
}

fn query_param(uri: &Uri, name: &str) -> Option<String> {
    parse_pairs(uri.query()?)
        .into_iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value)
}

fn form_value<'a>(form: &'a [(String, String)], name: &str) -> Option<&'a str> {
    form.iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::pool::{ConnectionPool, PoolConfig};
    use crate::process::BackendState;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct RecordingHandler {
        supervisor: Arc<Supervisor>,
        calls: Mutex<Vec<(BackendState, Vec<(String, String)>)>>,
        fail: bool,
    }

    impl GitHandler for RecordingHandler {
        fn handle<'a>(&'a self, form: &'a [(String, String)]) -> GitFuture<'a> {
            Box::pin(async move {
                self.calls.lock().push((self.supervisor.state(), form.to_vec()));
                if self.fail {
                    anyhow::bail!("remote rejected");
                }
                Ok(())
            })
        }
    }

    fn supervisor() -> Arc<Supervisor> {
        let mut config = BackendConfig::local("sleep", 1).with_args(vec!["30".to_string()]);
        config.host = "127.0.0.1".to_string();
        config.shutdown_grace_period_secs = 1;
        Supervisor::new(config, Arc::new(ConnectionPool::new(PoolConfig::default())))
    }

    fn git_request(uri: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(hyper::header::HOST, "cms.example.com:8000")
            .header(hyper::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    #[test]
    fn test_parse_form() {
        let form = parse_form(b"action=commit&message=Fix+typo+in+%22about%22&empty=&flag");
        assert_eq!(
            form,
            vec![
                ("action".to_string(), "commit".to_string()),
                ("message".to_string(), "Fix typo in \"about\"".to_string()),
                ("empty".to_string(), String::new()),
                ("flag".to_string(), String::new()),
            ]
        );
        assert!(parse_form(b"").is_empty());
    }

    #[test]
    fn test_query_param() {
        let uri: Uri = "/admin/_git?redirect=%2Fadmin%2Fpages&x=1".parse().unwrap();
        assert_eq!(query_param(&uri, "redirect").as_deref(), Some("/admin/pages"));
        assert_eq!(query_param(&uri, "missing"), None);

        let bare: Uri = "/admin/_git".parse().unwrap();
        assert_eq!(query_param(&bare, "redirect"), None);
    }

    #[tokio::test]
    async fn test_command_handler_runs_actions() {
        // `true` stands in for a git that always succeeds
        let ok = CommandGitHandler::new("true", None);
        for action in ["commit", "push", "pull", "sync"] {
            let form = vec![("action".to_string(), action.to_string())];
            ok.handle(&form).await.unwrap();
        }

        let form = vec![("action".to_string(), "rebase-everything".to_string())];
        let err = ok.handle(&form).await.unwrap_err();
        assert!(err.to_string().contains("Unknown git action"));

        let err = ok.handle(&[]).await.unwrap_err();
        assert!(err.to_string().contains("action"));
    }

    #[tokio::test]
    async fn test_command_handler_reports_failure() {
        let failing = CommandGitHandler::new("false", None);
        let form = vec![("action".to_string(), "push".to_string())];
        let err = failing.handle(&form).await.unwrap_err();
        assert!(err.to_string().contains("false push failed"));

        let missing = CommandGitHandler::new("/nonexistent/git", None);
        assert!(missing.handle(&form).await.is_err());
    }

    #[tokio::test]
    async fn test_git_action_stops_backend_before_delegating() {
        let supervisor = supervisor();
        supervisor.start().unwrap();
        assert_eq!(supervisor.state(), BackendState::Starting);

        let handler = RecordingHandler {
            supervisor: Arc::clone(&supervisor),
            calls: Mutex::new(Vec::new()),
            fail: false,
        };

        let response = handle_git_action(
            git_request("/admin/_git", "action=commit&message=hello"),
            &supervisor,
            &handler,
        )
        .await;

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            response.headers().get(hyper::header::LOCATION).unwrap(),
            "http://cms.example.com:8000/admin"
        );

        let calls = handler.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, BackendState::Stopped);
        assert_eq!(form_value(&calls[0].1, "message"), Some("hello"));
    }

    #[tokio::test]
    async fn test_git_action_redirect_param() {
        let supervisor = supervisor();
        let handler = RecordingHandler {
            supervisor: Arc::clone(&supervisor),
            calls: Mutex::new(Vec::new()),
            fail: false,
        };

        let response = handle_git_action(
            git_request("/admin/_git?redirect=%2Fadmin%2Fhistory", "action=pull"),
            &supervisor,
            &handler,
        )
        .await;

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            response.headers().get(hyper::header::LOCATION).unwrap(),
            "/admin/history"
        );
    }

    #[tokio::test]
    async fn test_git_action_failure_renders_500() {
        let supervisor = supervisor();
        let handler = RecordingHandler {
            supervisor: Arc::clone(&supervisor),
            calls: Mutex::new(Vec::new()),
            fail: true,
        };

        let response =
            handle_git_action(git_request("/admin/_git", "action=push"), &supervisor, &handler).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("remote rejected"));
    }
}
