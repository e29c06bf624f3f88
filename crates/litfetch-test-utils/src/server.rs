//! A loopback HTTP server with canned responses, for exercising the real
//! HTTP fetcher without leaving the machine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct Route {
    pub path: String,
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl Route {
    pub fn new(path: &str, status: u16, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self { path: path.to_string(), status, content_type: content_type.to_string(), body: body.into() }
    }

    pub fn pdf(path: &str, body: Vec<u8>) -> Self {
        Self::new(path, 200, "application/pdf", body)
    }

    pub fn html(path: &str, status: u16, body: &str) -> Self {
        Self::new(path, status, "text/html; charset=utf-8", body.as_bytes())
    }
}

/// Answers every connection with the route matching the request path, or 404.
/// One request per connection. Stops when dropped.
pub struct StaticServer {
    base: String,
    hits: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl StaticServer {
    pub async fn start(routes: Vec<Route>) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let base = format!("http://{}", listener.local_addr()?);
        let hits = Arc::new(AtomicUsize::new(0));
        let routes = Arc::new(routes);

        let counter = hits.clone();
        let handle = tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let routes = routes.clone();
                let counter = counter.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]);
                    let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                    counter.fetch_add(1, Ordering::SeqCst);

                    let missing = Route::new(&path, 404, "text/plain", &b"not found"[..]);
                    let route = routes.iter().find(|r| r.path == path).unwrap_or(&missing);
                    let head = format!(
                        "HTTP/1.1 {} Canned\r\ncontent-type: {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                        route.status,
                        route.content_type,
                        route.body.len(),
                    );
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(&route.body).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Ok(Self { base, hits, handle })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Requests answered so far.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for StaticServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_routes_and_fallback_404() {
        let server = StaticServer::start(vec![Route::html("/login", 200, "<html>Sign in</html>")])
            .await
            .unwrap();
        let port = server.base.rsplit(':').next().unwrap().to_string();

        let mut socket = tokio::net::TcpStream::connect(format!("127.0.0.1:{port}")).await.unwrap();
        socket.write_all(b"GET /elsewhere HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        let mut response = String::new();
        socket.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 404"));
        assert_eq!(server.hits(), 1);
        assert!(server.url("/login").ends_with("/login"));
    }
}
