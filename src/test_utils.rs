//! Test utilities and mock implementations.
//!
//! Descriptors come from the compiled `maestro.testing` package, so tests
//! work with real reflected schemas. The services below implement that
//! package and can be served on an ephemeral port, with or without the
//! reflection service.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use prost_reflect::{DescriptorPool, DynamicMessage, Value};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::service::Routes;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use crate::domain::Link;
use crate::error::{Error, Result};
use crate::execution::{Dialer, Invoker};
use crate::reflection::{Message, Rpc, Service};

pub mod proto {
    tonic::include_proto!("maestro.testing");
}

pub const FILE_DESCRIPTOR_SET: &[u8] =
    tonic::include_file_descriptor_set!("maestro_testing_descriptor");

pub const PACKAGE: &str = "maestro.testing";

/// Shared pool of the testing package.
pub fn descriptor_pool() -> DescriptorPool {
    static POOL: OnceLock<DescriptorPool> = OnceLock::new();
    POOL.get_or_init(|| {
        DescriptorPool::decode(FILE_DESCRIPTOR_SET).expect("testing descriptor set decodes")
    })
    .clone()
}

fn qualified(short: &str) -> String {
    format!("{}.{}", PACKAGE, short)
}

/// Message of the testing package by short name, e.g. `"Counter"`.
pub fn message(short: &str) -> Message {
    descriptor_pool()
        .get_message_by_name(&qualified(short))
        .unwrap_or_else(|| panic!("no message {}", short))
        .into()
}

/// Service of the testing package by short name.
pub fn service(short: &str) -> Service {
    descriptor_pool()
        .get_service_by_name(&qualified(short))
        .unwrap_or_else(|| panic!("no service {}", short))
        .into()
}

/// Method `method` of service `service_short`.
pub fn rpc(service_short: &str, method: &str) -> Rpc {
    service(service_short)
        .rpcs()
        .iter()
        .find(|r| r.name() == method)
        .cloned()
        .unwrap_or_else(|| panic!("no rpc {}/{}", service_short, method))
}

/// Dynamic `Counter`.
pub fn counter(value: i64, label: &str) -> DynamicMessage {
    let mut msg = message("Counter").new_instance();
    msg.set_field_by_name("value", Value::I64(value));
    msg.set_field_by_name("label", Value::String(label.to_string()));
    msg
}

/// `value` of a dynamic `Counter`.
pub fn counter_value(msg: &DynamicMessage) -> i64 {
    msg.get_field_by_name("value")
        .and_then(|v| v.as_i64())
        .unwrap_or_default()
}

pub fn link(
    name: &str,
    source_stage: &str,
    source_field: &str,
    target_stage: &str,
    target_field: &str,
) -> Link {
    Link::new(name, source_stage, target_stage)
        .with_source_field(source_field)
        .with_target_field(target_field)
}

// ============================================================================
// Services
// ============================================================================

use proto::echo_service_server::{EchoService, EchoServiceServer};
use proto::envelope_service_server::{EnvelopeService, EnvelopeServiceServer};
use proto::increment_service_server::{IncrementService, IncrementServiceServer};
use proto::{Counter, Envelope};

/// Replies with its request.
#[derive(Debug, Default, Clone)]
pub struct Echo;

#[tonic::async_trait]
impl EchoService for Echo {
    async fn echo(&self, request: Request<Counter>) -> std::result::Result<Response<Counter>, Status> {
        Ok(Response::new(request.into_inner()))
    }
}

/// Adds one to the counter.
#[derive(Debug, Default, Clone)]
pub struct Increment;

#[tonic::async_trait]
impl IncrementService for Increment {
    async fn increment(
        &self,
        request: Request<Counter>,
    ) -> std::result::Result<Response<Counter>, Status> {
        let mut counter = request.into_inner();
        counter.value += 1;
        Ok(Response::new(counter))
    }
}

/// Wraps counters into envelopes and back.
#[derive(Debug, Default, Clone)]
pub struct Enveloper;

#[tonic::async_trait]
impl EnvelopeService for Enveloper {
    async fn wrap(&self, request: Request<Counter>) -> std::result::Result<Response<Envelope>, Status> {
        Ok(Response::new(Envelope {
            counter: Some(request.into_inner()),
            note: "wrapped".to_string(),
        }))
    }

    async fn unwrap(
        &self,
        request: Request<Envelope>,
    ) -> std::result::Result<Response<Counter>, Status> {
        Ok(Response::new(request.into_inner().counter.unwrap_or_default()))
    }
}

pub fn echo_routes() -> Routes {
    Routes::new(EchoServiceServer::new(Echo))
}

pub fn increment_routes() -> Routes {
    Routes::new(IncrementServiceServer::new(Increment))
}

pub fn envelope_routes() -> Routes {
    Routes::new(EnvelopeServiceServer::new(Enveloper))
}

/// A server on an ephemeral local port. Aborted on drop.
pub struct TestServer {
    pub address: String,
    handle: JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn spawn_server(routes: Routes) -> TestServer {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test server");
    let address = listener.local_addr().expect("local addr").to_string();

    let handle = tokio::spawn(async move {
        Server::builder()
            .add_routes(routes)
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .expect("test server failed");
    });

    TestServer { address, handle }
}

/// Serve `routes` together with a reflection service that lists exactly
/// `services` (fully-qualified names).
pub async fn serve(routes: Routes, services: &[&str]) -> TestServer {
    let mut builder = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET);
    for name in services {
        builder = builder.with_service_name(*name);
    }
    let reflection = builder.build_v1().expect("build reflection service");
    spawn_server(routes.add_service(reflection)).await
}

/// Serve `routes` without any reflection service.
pub async fn serve_without_reflection(routes: Routes) -> TestServer {
    spawn_server(routes).await
}

pub async fn serve_echo() -> TestServer {
    serve(echo_routes(), &["maestro.testing.EchoService"]).await
}

pub async fn serve_increment() -> TestServer {
    serve(increment_routes(), &["maestro.testing.IncrementService"]).await
}

pub async fn serve_envelope() -> TestServer {
    serve(envelope_routes(), &["maestro.testing.EnvelopeService"]).await
}

// ============================================================================
// Invoker / Dialer mocks
// ============================================================================

type Respond = dyn Fn(&DynamicMessage, &mut DynamicMessage) -> Result<()> + Send + Sync;

/// Number of invocations a [`MockInvoker`] has received.
#[derive(Debug, Clone, Default)]
pub struct CallCount(Arc<AtomicUsize>);

impl CallCount {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// In-process invoker answering with a closure.
#[derive(Clone)]
pub struct MockInvoker {
    respond: Arc<Respond>,
    delay: Option<Duration>,
    calls: CallCount,
}

impl MockInvoker {
    pub fn new(
        respond: impl Fn(&DynamicMessage, &mut DynamicMessage) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            respond: Arc::new(respond),
            delay: None,
            calls: CallCount::default(),
        }
    }

    /// Copies the request into the reply, field number by field number.
    pub fn echo() -> Self {
        Self::new(|request, reply| {
            reply
                .transcode_from(request)
                .map_err(|e| Error::internal(e.to_string()))
        })
    }

    /// Echo of a `Counter` with its value incremented.
    pub fn increment() -> Self {
        Self::new(|request, reply| {
            reply
                .transcode_from(request)
                .map_err(|e| Error::internal(e.to_string()))?;
            reply.set_field_by_name("value", Value::I64(counter_value(request) + 1));
            Ok(())
        })
    }

    /// Fails every call with `error`.
    pub fn failing(error: Error) -> Self {
        let status = Status::from(error);
        Self::new(move |_, _| Err(Error::from(status.clone())))
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> CallCount {
        self.calls.clone()
    }
}

#[async_trait]
impl Invoker for MockInvoker {
    async fn invoke(&self, _rpc: &Rpc, request: &DynamicMessage, reply: &mut DynamicMessage) -> Result<()> {
        self.calls.0.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.respond)(request, reply)
    }
}

/// Dialer handing out preconfigured invokers by address.
#[derive(Default)]
pub struct MockDialer {
    invokers: Mutex<HashMap<String, Arc<dyn Invoker>>>,
    delays: Mutex<HashMap<String, Duration>>,
    dialed: Mutex<Vec<String>>,
}

impl MockDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_invoker(self, address: &str, invoker: impl Invoker + 'static) -> Self {
        self.invokers
            .lock()
            .unwrap()
            .insert(address.to_string(), Arc::new(invoker));
        self
    }

    /// Take `delay` to dial `address`.
    pub fn with_dial_delay(self, address: &str, delay: Duration) -> Self {
        self.delays
            .lock()
            .unwrap()
            .insert(address.to_string(), delay);
        self
    }

    /// Addresses dialed so far, in order.
    pub fn dialed(&self) -> Vec<String> {
        self.dialed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, address: &str) -> Result<Arc<dyn Invoker>> {
        self.dialed.lock().unwrap().push(address.to_string());
        let delay = self.delays.lock().unwrap().get(address).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.invokers
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or_else(|| Error::unavailable(format!("no route to {}", address)))
    }
}
