//! Docker Engine HTTP API client
//!
//! Engines are reached over TCP (`http://host:port`) or over their local
//! socket (`unix:///run/docker.sock`). Plain requests over TCP go through
//! reqwest; socket requests and the stdin upgrade speak HTTP/1.1 through a
//! hyper connection.

use super::{
    Chunks, ContainerInspect, ContainerSummary, CreateContainer, DockerApi, ImageInspect,
    ImageSummary,
};
use crate::error::{DominatorError, Result};
use async_trait::async_trait;
use base64::Engine as _;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UnixStream};

/// Host header sent to engines listening on a socket
const SOCKET_HOST: &str = "docker";

/// How requests reach the engine
enum Transport {
    Tcp { client: reqwest::Client },
    Unix { socket: PathBuf },
}

/// Client for one Docker engine
pub struct DockerClient {
    url: String,
    base: Url,
    transport: Transport,
}

/// A request to the engine, independent of the transport
struct Call {
    method: Method,
    url: Url,
    headers: Vec<(&'static str, String)>,
    body: Vec<u8>,
}

impl Call {
    fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    fn body(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.headers.push(("Content-Type", content_type.to_string()));
        self.body = body;
        self
    }

    fn json<T: Serialize>(self, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(self.body("application/json", body))
    }

    /// `path?query` as sent on the request line
    fn target(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        }
    }

    fn into_hyper(self) -> Result<hyper::Request<Full<Bytes>>> {
        let host = match (self.url.host_str(), self.url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => SOCKET_HOST.to_string(),
        };
        let mut builder = hyper::Request::builder()
            .method(self.method.clone())
            .uri(self.target())
            .header("Host", host);
        for (name, value) in &self.headers {
            builder = builder.header(*name, value.as_str());
        }
        builder
            .body(Full::new(Bytes::from(self.body)))
            .map_err(|e| DominatorError::Network(e.to_string()))
    }
}

enum ReplyBody {
    Tcp(reqwest::Response),
    Unix(Incoming),
}

/// The engine's answer to a call
struct Reply {
    status: u16,
    body: ReplyBody,
}

impl Reply {
    fn from_hyper(response: hyper::Response<Incoming>) -> Self {
        Self {
            status: response.status().as_u16(),
            body: ReplyBody::Unix(response.into_body()),
        }
    }

    async fn bytes(self) -> Result<Vec<u8>> {
        match self.body {
            ReplyBody::Tcp(response) => Ok(response.bytes().await?.to_vec()),
            ReplyBody::Unix(body) => Ok(body.collect().await?.to_bytes().to_vec()),
        }
    }

    async fn json<T: DeserializeOwned>(self) -> Result<T> {
        Ok(serde_json::from_slice(&self.bytes().await?)?)
    }

    /// Turn a non-success answer into an API error
    ///
    /// 304 counts as success: the engine answers it when the container is
    /// already in the requested state.
    async fn check(self) -> Result<Self> {
        let status = self.status;
        if (200..300).contains(&status) || status == 304 {
            return Ok(self);
        }
        let body = String::from_utf8_lossy(&self.bytes().await.unwrap_or_default()).into_owned();
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.message)
            .unwrap_or(body);
        Err(DominatorError::Api { status, message })
    }

    /// Forward the body through a channel as it arrives
    fn stream(self) -> Chunks {
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        tokio::spawn(async move {
            match self.body {
                ReplyBody::Tcp(mut response) => loop {
                    let chunk = match response.chunk().await {
                        Ok(Some(bytes)) => Ok(bytes.to_vec()),
                        Ok(None) => break,
                        Err(e) => Err(e.into()),
                    };
                    let failed = chunk.is_err();
                    if tx.send(chunk).await.is_err() || failed {
                        break;
                    }
                },
                ReplyBody::Unix(mut body) => loop {
                    let chunk = match body.frame().await {
                        Some(Ok(frame)) => match frame.into_data() {
                            Ok(data) => Ok(data.to_vec()),
                            Err(_) => continue,
                        },
                        Some(Err(e)) => Err(e.into()),
                        None => break,
                    };
                    let failed = chunk.is_err();
                    if tx.send(chunk).await.is_err() || failed {
                        break;
                    }
                },
            }
        });
        rx
    }
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct WaitResponse {
    #[serde(rename = "StatusCode")]
    status_code: i64,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    message: String,
}

/// Drive a connection until the engine or the client closes it
async fn drive<F>(connection: F)
where
    F: Future<Output = std::result::Result<(), hyper::Error>>,
{
    if let Err(e) = connection.await {
        tracing::debug!(error = %e, "engine connection closed");
    }
}

impl DockerClient {
    /// Create a client for the engine at `url`
    ///
    /// `url` is either `http://host:port` or `unix:///path/to/socket`.
    pub fn new(url: &str) -> Result<Self> {
        let url = url.trim_end_matches('/');
        let invalid = |reason: String| {
            DominatorError::InvalidConfig(format!("unsupported Docker URL {}: {}", url, reason))
        };

        let (base, transport) = if let Some(socket) = url.strip_prefix("unix://") {
            if !socket.starts_with('/') {
                return Err(invalid("the socket path must be absolute".to_string()));
            }
            let base = Url::parse(&format!("http://{}", SOCKET_HOST))
                .map_err(|e| invalid(e.to_string()))?;
            (base, Transport::Unix { socket: PathBuf::from(socket) })
        } else if url.starts_with("http://") {
            let base = Url::parse(url).map_err(|e| invalid(e.to_string()))?;
            let client = reqwest::Client::builder()
                .build()
                .map_err(|e| DominatorError::Network(e.to_string()))?;
            (base, Transport::Tcp { client })
        } else {
            return Err(invalid("only http:// and unix:// endpoints are supported".to_string()));
        };

        tracing::debug!(url, "creating docker client");
        Ok(Self {
            url: url.to_string(),
            base,
            transport,
        })
    }

    fn call(&self, method: Method, path: &str, query: &[(&str, &str)]) -> Call {
        let mut url = self.base.clone();
        url.set_path(path);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Call {
            method,
            url,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// `host:port` of a TCP engine
    fn authority(&self) -> String {
        let host = self.base.host_str().unwrap_or(SOCKET_HOST);
        match self.base.port_or_known_default() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    /// Open a fresh HTTP/1.1 connection that can be upgraded
    async fn connect(&self) -> Result<http1::SendRequest<Full<Bytes>>> {
        match &self.transport {
            Transport::Unix { socket } => {
                let stream = UnixStream::connect(socket).await.map_err(|e| {
                    DominatorError::Network(format!("failed to connect to {}: {}", socket.display(), e))
                })?;
                let (sender, connection) = http1::handshake(TokioIo::new(stream)).await?;
                tokio::spawn(drive(connection.with_upgrades()));
                Ok(sender)
            }
            Transport::Tcp { .. } => {
                let authority = self.authority();
                let stream = TcpStream::connect(&authority).await.map_err(|e| {
                    DominatorError::Network(format!("failed to connect to {}: {}", authority, e))
                })?;
                let (sender, connection) = http1::handshake(TokioIo::new(stream)).await?;
                tokio::spawn(drive(connection.with_upgrades()));
                Ok(sender)
            }
        }
    }

    async fn send(&self, call: Call) -> Result<Reply> {
        tracing::trace!(method = %call.method, target = %call.target(), "docker request");
        let reply = match &self.transport {
            Transport::Tcp { client } => {
                let mut request = client.request(call.method, call.url);
                for (name, value) in call.headers {
                    request = request.header(name, value);
                }
                if !call.body.is_empty() {
                    request = request.body(call.body);
                }
                let response = request.send().await?;
                Reply {
                    status: response.status().as_u16(),
                    body: ReplyBody::Tcp(response),
                }
            }
            Transport::Unix { .. } => {
                let mut sender = self.connect().await?;
                let response = sender.send_request(call.into_hyper()?).await?;
                Reply::from_hyper(response)
            }
        };
        reply.check().await
    }

    async fn post_stream(&self, path: &str, query: &[(&str, &str)]) -> Result<Chunks> {
        Ok(self.send(self.call(Method::POST, path, query)).await?.stream())
    }
}

#[async_trait]
impl DockerApi for DockerClient {
    fn url(&self) -> &str {
        &self.url
    }

    async fn containers(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        let call = self.call(Method::GET, "/containers/json", &[("all", if all { "1" } else { "0" })]);
        self.send(call).await?.json().await
    }

    async fn create_container(&self, name: &str, spec: &CreateContainer) -> Result<String> {
        let call = self
            .call(Method::POST, "/containers/create", &[("name", name)])
            .json(spec)?;
        let created: CreateResponse = self.send(call).await?.json().await?;
        Ok(created.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.send(self.call(Method::POST, &format!("/containers/{}/start", id), &[]))
            .await?;
        Ok(())
    }

    async fn stop(&self, id: &str, timeout_secs: u64) -> Result<()> {
        let timeout = timeout_secs.to_string();
        let call = self.call(Method::POST, &format!("/containers/{}/stop", id), &[("t", timeout.as_str())]);
        self.send(call).await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        let force = force.to_string();
        let call = self.call(Method::DELETE, &format!("/containers/{}", id), &[("force", force.as_str())]);
        self.send(call).await?;
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspect> {
        let call = self.call(Method::GET, &format!("/containers/{}/json", id), &[]);
        self.send(call).await?.json().await
    }

    async fn wait(&self, id: &str) -> Result<i64> {
        let call = self.call(Method::POST, &format!("/containers/{}/wait", id), &[]);
        let waited: WaitResponse = self.send(call).await?.json().await?;
        Ok(waited.status_code)
    }

    async fn logs(&self, id: &str, follow: bool) -> Result<Chunks> {
        let call = self.call(
            Method::GET,
            &format!("/containers/{}/logs", id),
            &[
                ("stdout", "1"),
                ("stderr", "1"),
                ("follow", if follow { "1" } else { "0" }),
            ],
        );
        Ok(self.send(call).await?.stream())
    }

    async fn attach(&self, id: &str) -> Result<Chunks> {
        self.post_stream(
            &format!("/containers/{}/attach", id),
            &[("stdout", "1"), ("stderr", "1"), ("logs", "1"), ("stream", "1")],
        )
        .await
    }

    async fn send_stdin(&self, id: &str, data: &[u8]) -> Result<()> {
        // The engine hijacks the connection for stdin
        let call = self
            .call(
                Method::POST,
                &format!("/containers/{}/attach", id),
                &[("stdin", "1"), ("stream", "1")],
            )
            .header("Connection", "Upgrade")
            .header("Upgrade", "tcp");
        let mut sender = self.connect().await?;
        let response = sender.send_request(call.into_hyper()?).await?;
        if response.status() != hyper::StatusCode::SWITCHING_PROTOCOLS {
            let status = response.status().as_u16();
            Reply::from_hyper(response).check().await?;
            return Err(DominatorError::Api {
                status,
                message: format!("attach to stdin of {} refused", id),
            });
        }

        let mut upgraded = TokioIo::new(hyper::upgrade::on(response).await?);
        upgraded.write_all(data).await?;
        upgraded.shutdown().await?;
        Ok(())
    }

    async fn images(&self, repository: &str) -> Result<Vec<ImageSummary>> {
        let filters = serde_json::json!({ "reference": [repository] }).to_string();
        let call = self.call(Method::GET, "/images/json", &[("all", "1"), ("filters", filters.as_str())]);
        self.send(call).await?.json().await
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageInspect> {
        let call = self.call(Method::GET, &format!("/images/{}/json", reference), &[]);
        self.send(call).await?.json().await
    }

    async fn pull(&self, repository: &str, tag: &str) -> Result<Chunks> {
        self.post_stream("/images/create", &[("fromImage", repository), ("tag", tag)])
            .await
    }

    async fn push(&self, repository: &str, tag: &str) -> Result<Chunks> {
        // The engine insists on an auth header even for anonymous pushes
        let auth = base64::engine::general_purpose::STANDARD.encode("{}");
        let call = self
            .call(Method::POST, &format!("/images/{}/push", repository), &[("tag", tag)])
            .header("X-Registry-Auth", auth);
        Ok(self.send(call).await?.stream())
    }

    async fn build(&self, tag: &str, context: Vec<u8>) -> Result<Chunks> {
        let call = self
            .call(Method::POST, "/build", &[("t", tag), ("rm", "1")])
            .body("application/x-tar", context);
        Ok(self.send(call).await?.stream())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
    use tokio::net::UnixListener;

    /// Serve one connection on `socket`: return the request head, answer
    /// with `reply`, then collect whatever the client sends after it
    async fn serve_once(socket: &Path, reply: String) -> tokio::task::JoinHandle<(String, Vec<u8>)> {
        let listener = UnixListener::bind(socket).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(stream);
            let mut head = String::new();
            loop {
                let mut line = String::new();
                stream.read_line(&mut line).await.unwrap();
                head.push_str(&line);
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            stream.get_mut().write_all(reply.as_bytes()).await.unwrap();
            let mut rest = Vec::new();
            if reply.starts_with("HTTP/1.1 101") {
                stream.read_to_end(&mut rest).await.unwrap();
            }
            (head, rest)
        })
    }

    #[test]
    fn test_rejects_unsupported_urls() {
        assert!(DockerClient::new("https://dock.example.com:2376").is_err());
        assert!(DockerClient::new("tcp://dock.example.com:2376").is_err());
        assert!(DockerClient::new("unix://run/docker.sock").is_err());
    }

    #[test]
    fn test_accepts_socket_urls() {
        let client = DockerClient::new("unix:///run/docker.sock").unwrap();
        assert_eq!(client.url(), "unix:///run/docker.sock");
        assert!(matches!(&client.transport, Transport::Unix { socket } if socket == Path::new("/run/docker.sock")));
    }

    #[test]
    fn test_call_target_and_authority() {
        let client = DockerClient::new("http://ship1.example.com:4243/").unwrap();
        assert_eq!(client.url(), "http://ship1.example.com:4243");
        assert_eq!(client.authority(), "ship1.example.com:4243");

        let filters = serde_json::json!({ "reference": ["yandex/app"] }).to_string();
        let call = client.call(Method::GET, "/images/json", &[("all", "1"), ("filters", filters.as_str())]);
        assert_eq!(
            call.target(),
            "/images/json?all=1&filters=%7B%22reference%22%3A%5B%22yandex%2Fapp%22%5D%7D"
        );
        assert_eq!(call.url.as_str(), format!("http://ship1.example.com:4243{}", call.target()));
    }

    #[tokio::test]
    async fn test_requests_over_socket() {
        let temp = tempfile::tempdir().unwrap();
        let socket = temp.path().join("docker.sock");
        let body = r#"[{"Id":"abc","Names":["/web"],"Image":"nginx","State":"running","Status":"Up"}]"#;
        let reply = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let server = serve_once(&socket, reply).await;

        let client = DockerClient::new(&format!("unix://{}", socket.display())).unwrap();
        let containers = client.containers(true).await.unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].id, "abc");

        let (head, _) = server.await.unwrap();
        assert!(head.starts_with("GET /containers/json?all=1 HTTP/1.1\r\n"));
        assert!(head.contains("host: docker\r\n") || head.contains("Host: docker\r\n"));
    }

    #[tokio::test]
    async fn test_api_errors_over_socket() {
        let temp = tempfile::tempdir().unwrap();
        let socket = temp.path().join("docker.sock");
        let server = serve_once(
            &socket,
            "HTTP/1.1 404 Not Found\r\nContent-Type: application/json\r\nContent-Length: 29\r\n\r\n{\"message\":\"no such image x\"}".to_string(),
        )
        .await;

        let client = DockerClient::new(&format!("unix://{}", socket.display())).unwrap();
        let err = client.inspect_image("x").await.unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert!(err.explains("no such image"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_stdin_over_socket() {
        let temp = tempfile::tempdir().unwrap();
        let socket = temp.path().join("docker.sock");
        let server = serve_once(
            &socket,
            "HTTP/1.1 101 UPGRADED\r\nConnection: Upgrade\r\nUpgrade: tcp\r\n\r\n".to_string(),
        )
        .await;

        let client = DockerClient::new(&format!("unix://{}", socket.display())).unwrap();
        client.send_stdin("abc", b"name: cargo\n").await.unwrap();

        let (head, rest) = server.await.unwrap();
        assert!(head.starts_with("POST /containers/abc/attach?stdin=1&stream=1 HTTP/1.1\r\n"));
        assert!(head.to_lowercase().contains("upgrade: tcp\r\n"));
        assert_eq!(rest, b"name: cargo\n");
    }
}
