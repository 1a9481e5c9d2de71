/*!
Sink HTTP pour les callbacks de fin de séquence

Petit serveur axum sur 127.0.0.1:0 qui accepte n'importe quelle requête et
la garde en mémoire. Remplace le moteur de workflow (CPEE) dans les tests.
*/

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::Router;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct ReceivedCall {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
    pub at: Instant,
}

type Calls = Arc<Mutex<Vec<ReceivedCall>>>;

pub struct CallbackSink {
    addr: SocketAddr,
    calls: Calls,
    server: JoinHandle<()>,
}

async fn record(State(calls): State<Calls>, method: Method, uri: Uri, body: Bytes) -> StatusCode {
    let call = ReceivedCall {
        method: method.to_string(),
        path: uri.path().to_string(),
        body: body.to_vec(),
        at: Instant::now(),
    };
    log::info!("[SINK] {} {}", call.method, call.path);
    match calls.lock() {
        Ok(mut calls) => {
            calls.push(call);
            StatusCode::OK
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl CallbackSink {
    /// Démarre le serveur sur un port libre
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));

        let app = Router::new().fallback(record).with_state(calls.clone());
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                log::warn!("[SINK] server stopped: {e}");
            }
        });

        Ok(Self { addr, calls, server })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn calls(&self) -> Vec<ReceivedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Attend au moins `count` appels ou l'expiration du délai
    pub async fn wait_for_calls(&self, count: usize, timeout: Duration) -> Vec<ReceivedCall> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            let calls = self.calls();
            if calls.len() >= count {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        log::warn!("[SINK] timeout waiting for {count} call(s)");
        self.calls()
    }
}

impl Drop for CallbackSink {
    fn drop(&mut self) {
        self.server.abort();
    }
}
