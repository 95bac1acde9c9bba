use std::path::{Component, Path, PathBuf};

use clap::{Parser, Subcommand};
use serde_json::{Map, Value, json};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned HTTP {status}: {body}")]
    Server { status: u16, body: String },
    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is not under --root {root}")]
    OutsideRoot { path: PathBuf, root: PathBuf },
    #[error("missing expected field `{0}`")]
    MissingField(&'static str),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "symbi-cli", about = "SYMBI gateway CLI")]
struct Cli {
    #[arg(long, env = "SYMBI_BASE_URL", default_value = "http://127.0.0.1:3000")]
    base_url: String,

    /// Identity sent with persona requests.
    #[arg(long, env = "SYMBI_USER", default_value = "Stephen")]
    user: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Health check.
    Ping,
    Whoami,
    /// Ask SYMBI directly.
    Ask {
        message: String,
        #[arg(long, help = "JSON object passed as context")]
        context: Option<String>,
    },
    /// Resolve a model name (the server keeps no selection).
    Switch { model: String },
    /// Fork from the server's current signature.
    Fork {
        name: String,
        #[arg(long)]
        instructions: Option<String>,
    },
    /// Commit local files to the configured repository.
    Push {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        #[arg(long, short)]
        message: Option<String>,
        #[arg(long)]
        branch: Option<String>,
        #[arg(long, default_value = ".", help = "Repository paths are relative to this directory")]
        root: PathBuf,
    },
    /// Repository status.
    Status,
    /// Which provider keys the server has.
    Keys,
}

#[derive(Debug, Clone)]
struct CliContext {
    base_url: String,
    user: String,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    let ctx = CliContext { base_url: cli.base_url, user: cli.user };

    let json = match cli.command {
        Command::Ping => return run_ping(&ctx).await,
        Command::Whoami => api_request(&ctx, reqwest::Method::GET, "/api/whoami", None).await?,
        Command::Ask { message, context } => {
            let body = ask_body(&ctx, &message, context.as_deref())?;
            api_request(&ctx, reqwest::Method::POST, "/api/ask", Some(body)).await?
        }
        Command::Switch { model } => {
            let body = json!({ "user": ctx.user, "model": model });
            api_request(&ctx, reqwest::Method::POST, "/api/switch", Some(body)).await?
        }
        Command::Fork { name, instructions } => {
            let whoami = api_request(&ctx, reqwest::Method::GET, "/api/whoami", None).await?;
            let signature = whoami
                .get("signature")
                .and_then(Value::as_str)
                .ok_or(CliError::MissingField("signature"))?;
            let body = fork_body(&ctx, &name, instructions.as_deref(), signature);
            api_request(&ctx, reqwest::Method::POST, "/api/fork", Some(body)).await?
        }
        Command::Push { paths, message, branch, root } => {
            let body = push_body(&root, &paths, message, branch)?;
            api_request(&ctx, reqwest::Method::POST, "/api/push-to-github", Some(body)).await?
        }
        Command::Status => api_request(&ctx, reqwest::Method::GET, "/api/github-status", None).await?,
        Command::Keys => api_request(&ctx, reqwest::Method::GET, "/api/verify-actual-keys", None).await?,
    };
    print_json(&json)
}

async fn run_ping(cli: &CliContext) -> Result<(), CliError> {
    let url = format!("{}/healthz", cli.base_url.trim_end_matches('/'));
    let response = reqwest::Client::new().get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(CliError::Server { status: status.as_u16(), body: "health check failed".to_owned() });
    }
    println!("ok");
    Ok(())
}

// =============================================================================
// REQUEST BODIES
// =============================================================================

fn ask_body(cli: &CliContext, message: &str, context: Option<&str>) -> Result<Value, CliError> {
    let context = match context {
        Some(raw) => serde_json::from_str::<Value>(raw)?,
        None => Value::Object(Map::new()),
    };
    Ok(json!({ "user": cli.user, "message": message, "context": context }))
}

fn fork_body(cli: &CliContext, name: &str, instructions: Option<&str>, parent_signature: &str) -> Value {
    json!({
        "user": cli.user,
        "forkName": name,
        "instructions": instructions,
        "parentSignature": parent_signature,
    })
}

/// Absolute, lexically normalized form of `path`.
///
/// Relative paths resolve against the working directory. Symlinks are not
/// followed.
fn normalize(path: &Path) -> Result<PathBuf, CliError> {
    let absolute =
        std::path::absolute(path).map_err(|source| CliError::ReadFile { path: path.to_path_buf(), source })?;
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

/// Repository path for `path`: relative to `root`, `/`-separated.
fn repo_path(root: &Path, path: &Path) -> Result<String, CliError> {
    let outside = || CliError::OutsideRoot { path: path.to_path_buf(), root: root.to_path_buf() };
    let (root_abs, path_abs) = (normalize(root)?, normalize(path)?);
    let relative = path_abs.strip_prefix(&root_abs).map_err(|_| outside())?;
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        return Err(outside());
    }
    Ok(parts.join("/"))
}

fn push_body(root: &Path, paths: &[PathBuf], message: Option<String>, branch: Option<String>) -> Result<Value, CliError> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let content =
            std::fs::read_to_string(path).map_err(|source| CliError::ReadFile { path: path.clone(), source })?;
        files.push(json!({ "path": repo_path(root, path)?, "content": content }));
    }

    let mut body = Map::new();
    body.insert("files".to_owned(), Value::Array(files));
    if let Some(message) = message {
        body.insert("message".to_owned(), Value::String(message));
    }
    if let Some(branch) = branch {
        body.insert("branch".to_owned(), Value::String(branch));
    }
    Ok(Value::Object(body))
}

// =============================================================================
// HTTP
// =============================================================================

async fn api_request(
    cli: &CliContext,
    method: reqwest::Method,
    path: &str,
    body: Option<Value>,
) -> Result<Value, CliError> {
    let url = format!("{}{}", cli.base_url.trim_end_matches('/'), path);
    let request = reqwest::Client::new().request(method, &url);
    let request = if let Some(json) = body { request.json(&json) } else { request };

    let response = request.send().await?;
    let status = response.status();
    let value = response.json::<Value>().await.unwrap_or(Value::Null);

    if !status.is_success() {
        return Err(CliError::Server { status: status.as_u16(), body: value.to_string() });
    }
    Ok(value)
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> CliContext {
        CliContext { base_url: "http://localhost:3000".into(), user: "Stephen".into() }
    }

    #[test]
    fn ask_carries_user_and_parsed_context() {
        let body = ask_body(&ctx(), "hi", Some(r#"{"phase":"mvp"}"#)).unwrap();
        assert_eq!(body, json!({ "user": "Stephen", "message": "hi", "context": { "phase": "mvp" } }));

        let body = ask_body(&ctx(), "hi", None).unwrap();
        assert_eq!(body["context"], json!({}));
    }

    #[test]
    fn ask_rejects_bad_context_json() {
        let err = ask_body(&ctx(), "hi", Some("{")).unwrap_err();
        assert!(matches!(err, CliError::InvalidJson(_)));
    }

    #[test]
    fn fork_uses_camel_case_fields() {
        let body = fork_body(&ctx(), "scout", None, "SYMBI-v1.0-FREEDOM-STACK");
        assert_eq!(body["forkName"], "scout");
        assert_eq!(body["parentSignature"], "SYMBI-v1.0-FREEDOM-STACK");
        assert!(body["instructions"].is_null());
    }

    #[test]
    fn repo_path_is_relative_to_root() {
        let root = Path::new("/work/site");
        assert_eq!(repo_path(root, Path::new("/work/site/docs/plan.md")).unwrap(), "docs/plan.md");
        assert!(matches!(
            repo_path(root, Path::new("/etc/passwd")).unwrap_err(),
            CliError::OutsideRoot { .. }
        ));
        assert!(matches!(
            repo_path(root, Path::new("/work/site/../other/x.md")).unwrap_err(),
            CliError::OutsideRoot { .. }
        ));
    }

    #[test]
    fn repo_path_accepts_bare_paths_under_default_root() {
        let root = Path::new(".");
        assert_eq!(repo_path(root, Path::new("README.md")).unwrap(), "README.md");
        assert_eq!(repo_path(root, Path::new("./README.md")).unwrap(), "README.md");
        assert_eq!(repo_path(root, Path::new("docs/plan.md")).unwrap(), "docs/plan.md");
        assert!(matches!(repo_path(root, Path::new("../outside.md")).unwrap_err(), CliError::OutsideRoot { .. }));
    }

    #[test]
    fn repo_path_mixes_relative_root_with_absolute_path() {
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(repo_path(Path::new("."), &cwd.join("docs").join("plan.md")).unwrap(), "docs/plan.md");
    }

    #[test]
    fn push_reads_local_files() {
        let dir = std::env::temp_dir().join(format!("symbi-cli-test-{}", std::process::id()));
        std::fs::create_dir_all(dir.join("docs")).unwrap();
        let local = dir.join("docs").join("plan.md");
        std::fs::write(&local, "# plan").unwrap();

        let body = push_body(&dir, &[local], None, Some("dev".into())).unwrap();
        assert_eq!(body, json!({ "files": [{ "path": "docs/plan.md", "content": "# plan" }], "branch": "dev" }));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn push_missing_file_is_read_error() {
        let err = push_body(Path::new("/"), &[PathBuf::from("/nonexistent/symbi.md")], None, None).unwrap_err();
        assert!(matches!(err, CliError::ReadFile { .. }));
    }
}
