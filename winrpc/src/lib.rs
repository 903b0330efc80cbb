#![doc = include_str!("../README.md")]

pub mod client;
pub mod cookie;
pub mod file;
pub mod interceptor;
pub mod request;
pub mod response;
pub mod router;
pub mod server;

pub use client::{Client, ClientOptions, RequestConfig, ResponseValue};
pub use cookie::{CookieAttrs, CookieJar};
pub use file::FileValue;
pub use interceptor::InterceptorChain;
pub use request::ServerRequest;
pub use response::ServerResponse;
pub use router::{Handler, MiddlewareHandler, Next, Params, Router};
pub use server::{Server, ServerOptions};

pub use winrpc_core::{EndpointOptions, MessageSource, OriginPolicy, RpcError};

use std::sync::Arc;

/// Builds a client endpoint over `backend` (§6.2 `create_client`).
pub fn create_client(
    backend: Arc<dyn MessageSource>,
    endpoint_options: EndpointOptions,
    client_options: ClientOptions,
) -> Arc<Client> {
    Client::new(backend, endpoint_options, client_options)
}

/// Builds a server endpoint over `backend` (§6.2 `create_server`).
pub fn create_server(
    backend: Arc<dyn MessageSource>,
    endpoint_options: EndpointOptions,
    server_options: ServerOptions,
) -> Arc<Server> {
    Server::new(backend, endpoint_options, server_options)
}

/// Either half of a winrpc connection, for callers that decide client vs.
/// server role at runtime rather than at the call site (§6.2
/// `create_endpoint`).
pub enum Endpoint {
    Client(Arc<Client>),
    Server(Arc<Server>),
}

impl Endpoint {
    pub fn endpoint_id(&self) -> &str {
        match self {
            Endpoint::Client(client) => client.endpoint_id(),
            Endpoint::Server(server) => server.endpoint_id(),
        }
    }

    pub fn close(&self) {
        match self {
            Endpoint::Client(client) => client.close(),
            Endpoint::Server(server) => server.close(),
        }
    }
}

/// Role requested of `create_endpoint`.
pub enum EndpointRole {
    Client(ClientOptions),
    Server(ServerOptions),
}

pub fn create_endpoint(backend: Arc<dyn MessageSource>, endpoint_options: EndpointOptions, role: EndpointRole) -> Endpoint {
    match role {
        EndpointRole::Client(client_options) => Endpoint::Client(create_client(backend, endpoint_options, client_options)),
        EndpointRole::Server(server_options) => Endpoint::Server(create_server(backend, endpoint_options, server_options)),
    }
}
