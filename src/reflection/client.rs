//! gRPC server reflection client.

use std::collections::{HashMap, HashSet};

use prost::Message as _;
use prost_reflect::DescriptorPool;
use prost_types::{FileDescriptorProto, FileDescriptorSet};
use tonic::transport::Channel;
use tonic::{Code as GrpcCode, Status};
use tonic_reflection::pb::v1::server_reflection_client::ServerReflectionClient;
use tonic_reflection::pb::v1::server_reflection_request::MessageRequest;
use tonic_reflection::pb::v1::server_reflection_response::MessageResponse;
use tonic_reflection::pb::v1::ServerReflectionRequest;
use tracing::debug;

use super::Service;
use crate::error::{Error, Result};

/// Reflection services a server may expose. They are plumbing, never a
/// pipeline stage, so listings leave them out.
pub const REFLECTION_SERVICES: &[&str] = &[
    "grpc.reflection.v1.ServerReflection",
    "grpc.reflection.v1alpha.ServerReflection",
];

/// Queries a peer's reflection service.
#[derive(Clone)]
pub struct ReflectionClient {
    client: ServerReflectionClient<Channel>,
}

impl ReflectionClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: ServerReflectionClient::new(channel),
        }
    }

    /// Names of the services the peer exposes, reflection excluded.
    pub async fn list_services(&self) -> Result<Vec<String>> {
        let response = self
            .request(MessageRequest::ListServices(String::new()))
            .await?;
        match response {
            MessageResponse::ListServicesResponse(list) => Ok(list
                .service
                .into_iter()
                .map(|s| s.name)
                .filter(|name| !REFLECTION_SERVICES.contains(&name.as_str()))
                .collect()),
            other => Err(unexpected_response("list services", &other)),
        }
    }

    /// Resolve a service by fully-qualified name, with all its methods and
    /// the message schemas they reference.
    pub async fn resolve_service(&self, name: &str) -> Result<Service> {
        let files = self.file_closure(name).await?;

        let mut pool = DescriptorPool::new();
        pool.add_file_descriptor_set(FileDescriptorSet {
            file: sort_by_dependencies(files),
        })
        .map_err(|e| Error::unknown(format!("invalid descriptors for {}: {}", name, e)))?;

        let desc = pool
            .get_service_by_name(name)
            .ok_or_else(|| Error::not_found(format!("service {}", name)))?;
        Ok(Service::new(desc))
    }

    /// Fetch the file defining `symbol` and every file it transitively imports.
    async fn file_closure(&self, symbol: &str) -> Result<Vec<FileDescriptorProto>> {
        let mut files: HashMap<String, FileDescriptorProto> = HashMap::new();

        let first = self
            .request(MessageRequest::FileContainingSymbol(symbol.to_string()))
            .await?;
        let mut pending = absorb(&mut files, first, symbol)?;

        while let Some(filename) = pending.pop() {
            if files.contains_key(&filename) {
                continue;
            }
            debug!(file = %filename, "Fetching imported descriptor");
            let response = self
                .request(MessageRequest::FileByFilename(filename.clone()))
                .await?;
            pending.extend(absorb(&mut files, response, &filename)?);
        }

        Ok(files.into_values().collect())
    }

    /// Send one reflection request and read its single response.
    async fn request(&self, message: MessageRequest) -> Result<MessageResponse> {
        let request = ServerReflectionRequest {
            host: String::new(),
            message_request: Some(message),
        };

        let mut client = self.client.clone();
        let mut stream = client
            .server_reflection_info(tokio_stream::once(request))
            .await
            .map_err(map_status)?
            .into_inner();

        let response = stream
            .message()
            .await
            .map_err(map_status)?
            .ok_or_else(|| Error::unknown("reflection stream closed without a response"))?;

        match response.message_response {
            Some(MessageResponse::ErrorResponse(e)) => {
                if e.error_code == GrpcCode::NotFound as i32 {
                    Err(Error::not_found(e.error_message))
                } else {
                    Err(Error::unknown(e.error_message))
                }
            }
            Some(r) => Ok(r),
            None => Err(Error::unknown("empty reflection response")),
        }
    }
}

/// Decode the files of a descriptor response into `files`, returning the
/// imports that are not known yet.
fn absorb(
    files: &mut HashMap<String, FileDescriptorProto>,
    response: MessageResponse,
    requested: &str,
) -> Result<Vec<String>> {
    let encoded = match response {
        MessageResponse::FileDescriptorResponse(r) => r.file_descriptor_proto,
        other => return Err(unexpected_response(requested, &other)),
    };

    let mut missing = Vec::new();
    for bytes in encoded {
        let file = FileDescriptorProto::decode(bytes.as_slice())
            .map_err(|e| Error::unknown(format!("decode descriptor for {}: {}", requested, e)))?;
        missing.extend(
            file.dependency
                .iter()
                .filter(|dep| !files.contains_key(*dep))
                .cloned(),
        );
        files.insert(file.name().to_string(), file);
    }
    missing.retain(|dep| !files.contains_key(dep));
    Ok(missing)
}

/// Order files so that every file follows its imports.
fn sort_by_dependencies(files: Vec<FileDescriptorProto>) -> Vec<FileDescriptorProto> {
    fn visit(
        name: &str,
        by_name: &mut HashMap<String, FileDescriptorProto>,
        seen: &mut HashSet<String>,
        sorted: &mut Vec<FileDescriptorProto>,
    ) {
        if !seen.insert(name.to_string()) {
            return;
        }
        let Some(file) = by_name.remove(name) else {
            return;
        };
        for dep in &file.dependency {
            visit(dep, by_name, seen, sorted);
        }
        sorted.push(file);
    }

    let names: Vec<String> = files.iter().map(|f| f.name().to_string()).collect();
    let mut by_name: HashMap<String, FileDescriptorProto> = files
        .into_iter()
        .map(|f| (f.name().to_string(), f))
        .collect();
    let mut seen = HashSet::new();
    let mut sorted = Vec::with_capacity(names.len());
    for name in &names {
        visit(name, &mut by_name, &mut seen, &mut sorted);
    }
    sorted
}

fn unexpected_response(request: &str, response: &MessageResponse) -> Error {
    let kind = match response {
        MessageResponse::FileDescriptorResponse(_) => "file descriptor",
        MessageResponse::AllExtensionNumbersResponse(_) => "extension numbers",
        MessageResponse::ListServicesResponse(_) => "list services",
        MessageResponse::ErrorResponse(_) => "error",
    };
    Error::unknown(format!(
        "unexpected {} response to reflection request {}",
        kind, request
    ))
}

/// Transport errors become Unavailable; a peer without reflection is a
/// FailedPrecondition; anything else is Unknown.
fn map_status(status: Status) -> Error {
    match status.code() {
        GrpcCode::Unavailable => {
            Error::unavailable(format!("reflection peer unreachable: {}", status.message()))
        }
        GrpcCode::Unimplemented => Error::failed_precondition(format!(
            "peer does not support server reflection: {}",
            status.message()
        )),
        _ => Error::unknown(format!(
            "reflection call failed ({:?}): {}",
            status.code(),
            status.message()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Code;

    fn file(name: &str, deps: &[&str]) -> FileDescriptorProto {
        FileDescriptorProto {
            name: Some(name.to_string()),
            dependency: deps.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_sort_by_dependencies_puts_imports_first() {
        let files = vec![
            file("c.proto", &["b.proto"]),
            file("a.proto", &[]),
            file("b.proto", &["a.proto"]),
        ];
        let sorted: Vec<String> = sort_by_dependencies(files)
            .iter()
            .map(|f| f.name().to_string())
            .collect();
        assert_eq!(sorted, vec!["a.proto", "b.proto", "c.proto"]);
    }

    #[test]
    fn test_sort_by_dependencies_ignores_unknown_imports() {
        let files = vec![file("a.proto", &["google/protobuf/empty.proto"])];
        let sorted = sort_by_dependencies(files);
        assert_eq!(sorted.len(), 1);
    }

    #[test]
    fn test_map_status_codes() {
        assert_eq!(map_status(Status::unavailable("down")).code(), Code::Unavailable);
        assert_eq!(
            map_status(Status::unimplemented("no reflection")).code(),
            Code::FailedPrecondition
        );
        assert_eq!(map_status(Status::internal("boom")).code(), Code::Unknown);
    }

    #[test]
    fn test_absorb_reports_missing_imports() {
        let mut files = HashMap::new();
        files.insert("a.proto".to_string(), file("a.proto", &[]));

        let response = MessageResponse::FileDescriptorResponse(
            tonic_reflection::pb::v1::FileDescriptorResponse {
                file_descriptor_proto: vec![file("b.proto", &["a.proto", "c.proto"]).encode_to_vec()],
            },
        );
        let missing = absorb(&mut files, response, "b.proto").unwrap();
        assert_eq!(missing, vec!["c.proto".to_string()]);
        assert!(files.contains_key("b.proto"));
    }
}
