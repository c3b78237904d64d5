use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::SendRequest;
use hyper::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HOST};
use hyper::rt::{Read, Write};
use hyper::{Request, Uri};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::client::resolver::ServiceResolver;
use crate::client::{ClientError, ServiceConfig};

const JSON: &str = "application/json";
const MAX_ERROR_BODY: usize = 512;
const MAX_IDLE_CONNECTIONS: usize = 8;

type Sender = SendRequest<Full<Bytes>>;

#[derive(Clone)]
pub(crate) enum Target {
    Address { host: String, port: u16 },
    Service {
        service: ServiceConfig,
        resolver: Arc<dyn ServiceResolver>,
    },
}

/// A configured connection to one webhook endpoint. Connections left idle
/// by earlier calls are reused; service endpoints are resolved each time a
/// new connection is opened.
pub struct RestClient {
    target: Target,
    /// Value of the `Host` header, also the authority the client was built for.
    authority: String,
    path: String,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    bearer_token: Option<String>,
    idle: Mutex<Vec<Sender>>,
}

impl fmt::Debug for RestClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestClient")
            .field("authority", &self.authority)
            .field("path", &self.path)
            .field("tls", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}

impl RestClient {
    pub(crate) fn new(
        target: Target,
        authority: String,
        path: String,
        tls: Option<(TlsConnector, ServerName<'static>)>,
        bearer_token: Option<String>,
    ) -> Self {
        Self {
            target,
            authority,
            path,
            tls,
            bearer_token,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn idle_connections(&self) -> usize {
        self.idle.lock().len()
    }

    /// POSTs `body` as JSON and decodes the JSON reply. The whole exchange,
    /// connection setup included, is bounded by `timeout`.
    pub async fn post<B, R>(&self, body: &B, timeout: Duration) -> Result<R, ClientError>
    where
        B: Serialize,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_vec(body).map_err(ClientError::Encode)?;
        let uri = request_uri(&self.path, timeout)?;
        let reply = tokio::time::timeout(timeout, self.send(uri, Bytes::from(payload)))
            .await
            .map_err(|_| ClientError::Timeout(timeout))??;
        serde_json::from_slice(&reply).map_err(ClientError::Decode)
    }

    async fn send(&self, uri: Uri, payload: Bytes) -> Result<Bytes, ClientError> {
        while let Some(mut sender) = self.take_idle() {
            if sender.ready().await.is_err() {
                continue;
            }
            let request = self.request(uri.clone(), payload.clone())?;
            match exchange(&mut sender, request).await {
                // closed by the server before our request went out
                Err(ClientError::Http(e)) if e.is_canceled() => continue,
                result => {
                    self.release(sender);
                    return result;
                }
            }
        }

        let mut sender = self.connect().await?;
        let result = exchange(&mut sender, self.request(uri, payload)?).await;
        self.release(sender);
        result
    }

    fn take_idle(&self) -> Option<Sender> {
        self.idle.lock().pop()
    }

    fn release(&self, sender: Sender) {
        if sender.is_closed() {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(sender);
        }
    }

    fn request(&self, uri: Uri, payload: Bytes) -> Result<Request<Full<Bytes>>, ClientError> {
        let mut request = Request::post(uri)
            .header(HOST, &self.authority)
            .header(CONTENT_TYPE, JSON)
            .header(ACCEPT, JSON);
        if let Some(token) = &self.bearer_token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        request
            .body(Full::new(payload))
            .map_err(|e| ClientError::InvalidRequest(e.to_string()))
    }

    async fn connect(&self) -> Result<Sender, ClientError> {
        let (host, port) = match &self.target {
            Target::Address { host, port } => (host.clone(), *port),
            Target::Service { service, resolver } => {
                let endpoint =
                    resolver.resolve_endpoint(&service.namespace, &service.name, service.port)?;
                (endpoint.host, endpoint.port)
            }
        };

        let tcp = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|source| ClientError::Connect {
                address: format!("{host}:{port}"),
                source,
            })?;
        debug!(authority = %self.authority, address = %format!("{host}:{port}"), "opened webhook connection");

        match &self.tls {
            Some((connector, server_name)) => {
                let stream = connector
                    .connect(server_name.clone(), tcp)
                    .await
                    .map_err(|source| ClientError::Handshake {
                        authority: self.authority.clone(),
                        source,
                    })?;
                handshake(TokioIo::new(stream)).await
            }
            None => handshake(TokioIo::new(tcp)).await,
        }
    }
}

async fn handshake<I>(io: I) -> Result<Sender, ClientError>
where
    I: Read + Write + Unpin + Send + 'static,
{
    let (sender, connection) = hyper::client::conn::http1::handshake(io).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("webhook connection closed: {e}");
        }
    });
    Ok(sender)
}

async fn exchange(
    sender: &mut Sender,
    request: Request<Full<Bytes>>,
) -> Result<Bytes, ClientError> {
    let response = sender.send_request(request).await?;
    let status = response.status();
    let body = response.into_body().collect().await?.to_bytes();

    if !status.is_success() {
        let text = String::from_utf8_lossy(&body[..body.len().min(MAX_ERROR_BODY)]).into_owned();
        return Err(ClientError::Status {
            code: status.as_u16(),
            body: text,
        });
    }
    Ok(body)
}

/// Appends a `timeout` hint, rounded up to whole seconds, to `path`.
fn request_uri(path: &str, timeout: Duration) -> Result<Uri, ClientError> {
    let mut seconds = timeout.as_secs();
    if timeout.subsec_nanos() > 0 {
        seconds += 1;
    }
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    let separator = if path.contains('?') { '&' } else { '?' };
    format!("{path}{separator}timeout={seconds}s")
        .parse::<Uri>()
        .map_err(|e| ClientError::InvalidRequest(e.to_string()))
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::routing::post;
    use axum::{Json, Router};
    use hyper_util::rt::TokioExecutor;
    use hyper_util::server::conn::auto::Builder;
    use hyper_util::service::TowerToHyperService;
    use serde_json::{Value, json};
    use tokio::net::TcpListener;

    use super::*;
    use crate::client::{
        ClientConfig, ClientManager, DnsServiceResolver, StaticAuthenticationInfoResolver,
    };

    /// An echo server that counts accepted connections.
    async fn counting_server() -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        let router = Router::new().route("/echo", post(|Json(body): Json<Value>| async move { Json(body) }));
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                let service = TowerToHyperService::new(router.clone().into_service());
                tokio::spawn(async move {
                    let _ = Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        (addr, accepted)
    }

    #[tokio::test]
    async fn test_connections_are_reused() {
        let (addr, accepted) = counting_server().await;
        let manager = ClientManager::default()
            .with_authentication_info_resolver(Arc::new(StaticAuthenticationInfoResolver::default()))
            .with_service_resolver(Arc::new(DnsServiceResolver));
        let client = manager
            .hook_client(&ClientConfig {
                name: "echo".to_string(),
                url: Some(format!("http://{addr}/echo")),
                ..Default::default()
            })
            .unwrap();

        for round in 0..3 {
            let reply: Value = client
                .post(&json!({"round": round}), Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(reply, json!({"round": round}));
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(client.idle_connections(), 1);
    }

    #[tokio::test]
    async fn test_server_errors_carry_status_and_body() {
        let router = Router::new().route(
            "/fail",
            post(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "draining") }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

        let client = RestClient::new(
            Target::Address {
                host: "127.0.0.1".to_string(),
                port: addr.port(),
            },
            addr.to_string(),
            "/fail".to_string(),
            None,
            None,
        );
        let err = client
            .post::<_, Value>(&json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Status { code: 503, ref body } if body == "draining"));
    }

    #[test]
    fn test_request_uri_rounds_timeout_up() {
        let uri = request_uri("/validate", Duration::from_millis(1500)).unwrap();
        assert_eq!(uri.to_string(), "/validate?timeout=2s");

        let uri = request_uri("", Duration::from_secs(10)).unwrap();
        assert_eq!(uri.to_string(), "/?timeout=10s");

        let uri = request_uri("hook?x=1", Duration::from_secs(3)).unwrap();
        assert_eq!(uri.to_string(), "/hook?x=1&timeout=3s");
    }
}
