//! Scripted in-memory adapter for pipeline tests

use async_trait::async_trait;
use outbound_governance::cluster::{ClusterAdapter, Endpoint, OperationInfo};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub const SERVICE: &str = "order-service";

/// What an endpoint does on its next invocation. Unscripted calls succeed.
#[derive(Debug, Clone)]
pub enum Behavior {
    Ok,
    /// Transient failure the adapter classifies as retryable.
    Unavailable,
    /// Failure the adapter never retries.
    Fatal,
    /// Failure carrying a status code; not retryable by the adapter itself.
    Status(&'static str),
    /// Succeed after a pause.
    Slow(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum MockError {
    #[error("{0} unavailable")]
    Unavailable(String),
    #[error("{0} rejected the request")]
    Fatal(String),
    #[error("{0} returned status {1}")]
    Status(String, String),
}

#[derive(Debug, Clone)]
pub struct MockRequest {
    pub path: String,
    pub method: Option<String>,
}

impl MockRequest {
    pub fn get(path: &str) -> Self {
        Self {
            path: path.to_string(),
            method: Some("GET".to_string()),
        }
    }

    pub fn post(path: &str) -> Self {
        Self {
            path: path.to_string(),
            method: Some("POST".to_string()),
        }
    }
}

pub struct MockAdapter {
    endpoints: Mutex<Vec<Endpoint>>,
    scripts: Mutex<HashMap<String, VecDeque<Behavior>>>,
    calls: Mutex<Vec<Endpoint>>,
    routes: AtomicUsize,
}

impl MockAdapter {
    /// `n` endpoints `10.0.0.1:80` .. `10.0.0.n:80`.
    pub fn with_endpoints(n: usize) -> Self {
        Self {
            endpoints: Mutex::new(endpoints(n)),
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            routes: AtomicUsize::new(0),
        }
    }

    pub fn script(&self, endpoint_id: &str, behaviors: impl IntoIterator<Item = Behavior>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(endpoint_id.to_string())
            .or_default()
            .extend(behaviors);
    }

    pub fn set_endpoints(&self, endpoints: Vec<Endpoint>) {
        *self.endpoints.lock().unwrap() = endpoints;
    }

    /// Ids of invoked endpoints, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|e| e.id.clone()).collect()
    }

    /// Addresses actually dialed, in call order.
    pub fn dialed(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|e| e.address()).collect()
    }

    pub fn route_count(&self) -> usize {
        self.routes.load(Ordering::SeqCst)
    }
}

pub fn endpoints(n: usize) -> Vec<Endpoint> {
    (1..=n).map(|i| Endpoint::new(format!("10.0.0.{i}"), 80)).collect()
}

pub fn id(i: usize) -> String {
    format!("10.0.0.{i}:80")
}

#[async_trait]
impl ClusterAdapter for MockAdapter {
    type Request = MockRequest;
    type Response = String;
    type Error = MockError;

    fn service(&self, _request: &MockRequest) -> String {
        SERVICE.to_string()
    }

    fn operation(&self, request: &MockRequest) -> OperationInfo {
        let op = OperationInfo::new(request.path.clone());
        match &request.method {
            Some(m) => op.with_method(m.clone()),
            None => op,
        }
    }

    async fn route(&self, _request: &MockRequest) -> outbound_governance::Result<Vec<Endpoint>> {
        self.routes.fetch_add(1, Ordering::SeqCst);
        Ok(self.endpoints.lock().unwrap().clone())
    }

    async fn invoke(&self, request: &MockRequest, endpoint: &Endpoint) -> Result<String, MockError> {
        let behavior = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&endpoint.id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Behavior::Ok);
        self.calls.lock().unwrap().push(endpoint.clone());
        match behavior {
            Behavior::Ok => Ok(format!("{} from {}", request.path, endpoint.id)),
            Behavior::Slow(pause) => {
                tokio::time::sleep(pause).await;
                Ok(format!("{} from {}", request.path, endpoint.id))
            }
            Behavior::Unavailable => Err(MockError::Unavailable(endpoint.id.clone())),
            Behavior::Fatal => Err(MockError::Fatal(endpoint.id.clone())),
            Behavior::Status(code) => Err(MockError::Status(endpoint.id.clone(), code.to_string())),
        }
    }

    fn is_retryable(&self, error: &MockError) -> bool {
        matches!(error, MockError::Unavailable(_))
    }

    fn error_code(&self, error: &MockError) -> Option<String> {
        match error {
            MockError::Status(_, code) => Some(code.clone()),
            _ => None,
        }
    }

    fn error_name(&self, error: &MockError) -> Option<String> {
        let name = match error {
            MockError::Unavailable(_) => "Unavailable",
            MockError::Fatal(_) => "Fatal",
            MockError::Status(..) => "Status",
        };
        Some(name.to_string())
    }
}
