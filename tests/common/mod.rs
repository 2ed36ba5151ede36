//! Shared harness for the REST integration tests: spins up the real axum
//! router over the in-memory store/queue, with a fixed JWT secret so tests
//! can mint their own bearer tokens without a running auth service.

use std::sync::Arc;

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use tokio::sync::broadcast;

use slice_orchestrator::audit::ApiAuditLogger;
use slice_orchestrator::auth::{Claims, JwtVerifier, Role};
use slice_orchestrator::drivers::{Driver, LinuxDriver, OpenstackDriver};
use slice_orchestrator::images::{ImageCatalogClient, OpenstackImageClient};
use slice_orchestrator::lifecycle::SliceLocks;
use slice_orchestrator::queue::MemoryQueue;
use slice_orchestrator::rest::{create_router, AppState};
use slice_orchestrator::domain::Zone;
use slice_orchestrator::store::memory::MemoryStore;
use slice_orchestrator::store::{DataStore, SliceStore};

pub const JWT_SECRET: &str = "test-secret-do-not-use-in-prod";

pub struct TestServer {
    pub base_url: String,
    pub store: Arc<MemoryStore>,
    shutdown: tokio::sync::oneshot::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub async fn spawn() -> Self {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());

        let linux_driver = LinuxDriver::new(
            Default::default(),
            String::new(),
            store.clone() as Arc<dyn DataStore>,
        );
        let openstack_driver = OpenstackDriver::new(
            String::new(),
            String::new(),
            String::new(),
            Default::default(),
            store.clone() as Arc<dyn DataStore>,
        );
        let driver = Arc::new(Driver::new(linux_driver, openstack_driver));

        let jwt = JwtVerifier::new(JWT_SECRET);
        let audit = Arc::new(ApiAuditLogger::new());
        let slice_locks = Arc::new(SliceLocks::new());
        let (events, _rx) = broadcast::channel(64);

        let images_dir = tempdir();
        std::fs::create_dir_all(&images_dir).unwrap();

        let state = AppState {
            store: store.clone() as Arc<dyn DataStore>,
            queue,
            driver,
            audit,
            jwt,
            events,
            slice_locks,
            images_dir: Arc::new(images_dir),
            image_catalog: Arc::new(ImageCatalogClient::new("http://127.0.0.1:1")),
            openstack_images: Arc::new(OpenstackImageClient::new("http://127.0.0.1:1", "")),
        };

        let app = create_router(state);
        let port = portpicker::pick_unused_port().expect("no free port for test server");
        let addr = format!("127.0.0.1:{port}");
        let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            store,
            shutdown: shutdown_tx,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> reqwest::Response {
        let mut req = reqwest::Client::new().get(self.url(path));
        if let Some(t) = token {
            req = req.bearer_auth(t);
        }
        req.send().await.expect("request failed")
    }

    pub async fn post_json(&self, path: &str, token: Option<&str>, body: &serde_json::Value) -> reqwest::Response {
        let mut req = reqwest::Client::new().post(self.url(path)).json(body);
        if let Some(t) = token {
            req = req.bearer_auth(t);
        }
        req.send().await.expect("request failed")
    }

    pub async fn delete(&self, path: &str, token: Option<&str>) -> reqwest::Response {
        let mut req = reqwest::Client::new().delete(self.url(path));
        if let Some(t) = token {
            req = req.bearer_auth(t);
        }
        req.send().await.expect("request failed")
    }

    /// Seed a slice directly through the store, bypassing the HTTP/queue
    /// pipeline, for tests that only need a row to exist (access-control
    /// checks, not_found lookups) rather than a fully deployed slice.
    pub async fn seed_slice(&self, owner: &str, name: &str, zone: Zone) -> i64 {
        let slice = self
            .store
            .create_slice(owner, name, zone, serde_json::json!({}))
            .await
            .unwrap();
        slice.id
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
    }
}

fn tempdir() -> std::path::PathBuf {
    let mut dir = std::env::temp_dir();
    dir.push(format!("slice-orchestrator-test-{}", uuid::Uuid::new_v4()));
    dir
}

pub fn token(id: &str, rol: Role) -> String {
    let claims = Claims {
        id: id.to_string(),
        correo: format!("{id}@example.com"),
        rol,
        exp: 9_999_999_999,
    };
    encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(JWT_SECRET.as_bytes())).unwrap()
}

#[allow(dead_code)]
pub fn cliente_token(id: &str) -> String {
    token(id, Role::Cliente)
}

#[allow(dead_code)]
pub fn admin_token(id: &str) -> String {
    token(id, Role::Admin)
}
