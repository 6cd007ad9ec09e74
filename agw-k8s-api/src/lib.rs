#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod gateway_route;

pub use self::gateway_route::{GatewayRoute, GatewayRouteBackend, GatewayRouteSpec, RoutePlugin};
pub use k8s_openapi::{
    api::{
        core::v1::{Secret, Service},
        discovery::v1::{Endpoint as SliceEndpoint, EndpointConditions, EndpointSlice},
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
    ByteString,
};
pub use kube::{
    api::{Api, ListParams},
    runtime::{watcher, WatchStreamExt},
    Client, Resource, ResourceExt,
};

/// Label carried by every EndpointSlice naming the Service that owns it.
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// The secret `type` the controllers accept TLS material from.
pub const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";
