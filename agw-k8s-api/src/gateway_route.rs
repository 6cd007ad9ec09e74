use std::collections::BTreeMap;

/// Declares an HTTP route from a path prefix to an in-cluster Service,
/// optionally guarded by a chain of Wasm plugins.
///
/// The backend service is joined with the route's own namespace to form the
/// cluster key (`k8s/<namespace>/<service>`) that endpoint discovery
/// publishes under.
#[derive(
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    kube::CustomResource,
    serde::Deserialize,
    serde::Serialize,
    schemars::JsonSchema,
)]
#[kube(
    group = "agw.masallsome.io",
    version = "v1",
    kind = "GatewayRoute",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct GatewayRouteSpec {
    /// Path prefix the route matches on. Required; routes without it are
    /// ignored.
    pub r#match: Option<String>,

    pub backend: Option<GatewayRouteBackend>,

    /// Plugins to run, in order, before the request is forwarded.
    pub plugins: Option<Vec<RoutePlugin>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GatewayRouteBackend {
    /// Name of the Service in the route's namespace. Required; routes
    /// without it are ignored.
    #[serde(alias = "service_name")]
    pub service_name: Option<String>,

    pub port: Option<u16>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoutePlugin {
    pub name: String,

    #[serde(alias = "wasm_path")]
    pub wasm_path: String,

    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_deserializes_from_camel_case_yaml() {
        let spec: GatewayRouteSpec = serde_yaml::from_str(
            r#"
            match: /api
            backend:
              serviceName: my-svc
              port: 8080
            plugins:
              - name: auth
                wasmPath: /plugins/auth.wasm
                config:
                  mode: strict
            "#,
        )
        .expect("must parse");

        assert_eq!(spec.r#match.as_deref(), Some("/api"));
        let backend = spec.backend.expect("backend");
        assert_eq!(backend.service_name.as_deref(), Some("my-svc"));
        assert_eq!(backend.port, Some(8080));
        let plugins = spec.plugins.expect("plugins");
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].config.get("mode").map(String::as_str), Some("strict"));
    }

    #[test]
    fn missing_fields_deserialize_to_none() {
        let spec: GatewayRouteSpec = serde_json::from_str("{}").expect("must parse");
        assert_eq!(spec, GatewayRouteSpec::default());
    }
}
