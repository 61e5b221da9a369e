//! HTTP ingress: host/path routing on top of the service proxy

mod forward;
mod resolver;
mod server;

pub use server::IngressServer;
